//! Microphone capture with band-energy voice detection.
//!
//! - [`config`]: capture and VAD parameters
//! - [`device`]: input device boundary and errors
//! - [`vad`]: FFT sub-band energies and the voice gate
//! - [`pipeline`]: framing, encoding and the start/stop lifecycle

pub mod config;
#[cfg(feature = "device-cpal")]
pub mod cpal_input;
pub mod device;
pub mod pipeline;
pub mod vad;

pub use config::CaptureConfig;
#[cfg(feature = "device-cpal")]
pub use cpal_input::CpalInputDevice;
pub use device::{
    ActiveInput, AudioInputDevice, CaptureError, CaptureResult, PushInputDevice, PushInputFeeder,
};
pub use pipeline::{AudioCapture, CaptureEvent, CaptureEvents, FrameProcessor};
pub use vad::{BandEnergyAnalyzer, GateState, VadTransition, VoiceGate};
