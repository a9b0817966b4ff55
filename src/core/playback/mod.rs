//! Jitter-buffered playback of model audio.
//!
//! # Overview
//!
//! - [`PlaybackScheduler`]: deterministic scheduling against a sink's output clock
//! - [`PlaybackHandle`]: tokio driver owning the scheduler, fed through a command queue
//! - [`AudioSink`]: output device boundary ([`VirtualSink`] headless, `CpalSink` with `device-cpal`)

pub mod config;
#[cfg(feature = "device-cpal")]
pub mod cpal_sink;
pub mod driver;
pub mod scheduler;
pub mod sink;

pub use config::PlaybackConfig;
#[cfg(feature = "device-cpal")]
pub use cpal_sink::CpalSink;
pub use driver::{PlaybackEvent, PlaybackEvents, PlaybackHandle};
pub use scheduler::PlaybackScheduler;
pub use sink::{
    AudioSink, PlaybackError, PlaybackResult, ScheduledBuffer, SinkMonitor, VirtualClock,
    VirtualSink,
};
