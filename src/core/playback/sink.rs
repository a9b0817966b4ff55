//! Audio output sinks.
//!
//! A sink accepts buffers scheduled at absolute times on its own output
//! clock. The [`PlaybackScheduler`](super::PlaybackScheduler) decides *when*
//! each buffer plays; the sink only renders.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Errors from the playback path.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// No usable output device
    #[error("Output device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The output stream failed
    #[error("Output stream error: {0}")]
    Stream(String),

    /// The playback driver has shut down
    #[error("Playback closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

pub type PlaybackResult<T> = Result<T, PlaybackError>;

/// An output device accepting buffers scheduled against its clock.
pub trait AudioSink: Send + 'static {
    /// Output clock in seconds. Monotonic, advances while audio renders.
    fn current_time(&self) -> f64;

    /// Sample rate of buffers handed to [`schedule`](Self::schedule).
    fn sample_rate(&self) -> u32;

    /// Play `samples` starting at `start_time` on the output clock.
    fn schedule(&mut self, start_time: f64, samples: Vec<f32>) -> PlaybackResult<()>;

    /// Fade everything scheduled so far to silence over `duration` seconds,
    /// then drop it. Buffers scheduled afterwards play at the current gain.
    fn fade_out_and_clear(&mut self, duration: f64);

    /// Master gain for buffers that are not fading.
    fn set_gain(&mut self, gain: f32);
}

// =============================================================================
// Virtual sink
// =============================================================================

/// Clock for [`VirtualSink`].
#[derive(Debug, Clone)]
pub enum VirtualClock {
    /// Advanced explicitly with [`VirtualClock::advance`]
    Manual(Arc<Mutex<f64>>),
    /// Follows the tokio clock (and therefore paused test time)
    Runtime(tokio::time::Instant),
}

impl VirtualClock {
    pub fn now(&self) -> f64 {
        match self {
            Self::Manual(t) => *t.lock(),
            Self::Runtime(origin) => origin.elapsed().as_secs_f64(),
        }
    }

    /// Move a manual clock forward. No effect on a runtime clock.
    pub fn advance(&self, seconds: f64) {
        if let Self::Manual(t) = self {
            *t.lock() += seconds;
        }
    }
}

/// One buffer accepted by a [`VirtualSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    pub start: f64,
    pub duration: f64,
    pub samples: usize,
    /// Incremented by every fade-out; older generations were cleared.
    pub generation: u64,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Debug)]
struct SinkState {
    scheduled: Vec<ScheduledBuffer>,
    fades: Vec<f64>,
    gain: f32,
    generation: u64,
}

/// Read-only view of what a [`VirtualSink`] was asked to do.
#[derive(Debug, Clone)]
pub struct SinkMonitor {
    state: Arc<Mutex<SinkState>>,
}

impl SinkMonitor {
    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        self.state.lock().scheduled.clone()
    }

    pub fn scheduled_count(&self) -> usize {
        self.state.lock().scheduled.len()
    }

    /// Buffers not cleared by a fade-out.
    pub fn live_buffers(&self) -> Vec<ScheduledBuffer> {
        let state = self.state.lock();
        state
            .scheduled
            .iter()
            .filter(|b| b.generation == state.generation)
            .cloned()
            .collect()
    }

    /// Clock times at which fade-outs were requested.
    pub fn fades(&self) -> Vec<f64> {
        self.state.lock().fades.clone()
    }

    pub fn gain(&self) -> f32 {
        self.state.lock().gain
    }
}

/// Sink with a virtual output clock that records instead of rendering.
///
/// Used headless (text-only sessions) and to observe scheduling in tests.
#[derive(Debug)]
pub struct VirtualSink {
    clock: VirtualClock,
    sample_rate: u32,
    state: Arc<Mutex<SinkState>>,
}

impl VirtualSink {
    fn with_clock(clock: VirtualClock, sample_rate: u32) -> Self {
        Self {
            clock,
            sample_rate,
            state: Arc::new(Mutex::new(SinkState {
                scheduled: Vec::new(),
                fades: Vec::new(),
                gain: 1.0,
                generation: 0,
            })),
        }
    }

    /// Sink whose clock only moves when advanced.
    pub fn manual(sample_rate: u32) -> Self {
        Self::with_clock(
            VirtualClock::Manual(Arc::new(Mutex::new(0.0))),
            sample_rate,
        )
    }

    /// Sink whose clock follows tokio time.
    pub fn realtime(sample_rate: u32) -> Self {
        Self::with_clock(
            VirtualClock::Runtime(tokio::time::Instant::now()),
            sample_rate,
        )
    }

    pub fn clock(&self) -> VirtualClock {
        self.clock.clone()
    }

    pub fn monitor(&self) -> SinkMonitor {
        SinkMonitor {
            state: self.state.clone(),
        }
    }
}

impl AudioSink for VirtualSink {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn schedule(&mut self, start_time: f64, samples: Vec<f32>) -> PlaybackResult<()> {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.scheduled.push(ScheduledBuffer {
            start: start_time,
            duration: samples.len() as f64 / self.sample_rate as f64,
            samples: samples.len(),
            generation,
        });
        Ok(())
    }

    fn fade_out_and_clear(&mut self, _duration: f64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.fades.push(now);
        state.generation += 1;
    }

    fn set_gain(&mut self, gain: f32) {
        self.state.lock().gain = gain;
    }
}
