//! Microphone boundary.
//!
//! An [`AudioInputDevice`] opens a stream that writes mono f32 samples at the
//! requested rate into a [`SampleProducer`]. The returned [`ActiveInput`]
//! keeps the stream alive until it is closed or dropped.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::core::audio::SampleProducer;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("Input device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Input stream error: {0}")]
    Stream(String),
}

pub type CaptureResult<T> = Result<T, CaptureError>;

/// A running input stream.
pub trait ActiveInput: Send {
    /// Stop the stream. Idempotent.
    fn close(&mut self);
}

#[async_trait]
pub trait AudioInputDevice: Send + 'static {
    /// Open the device. Resolves once the stream is running.
    async fn open(
        &mut self,
        sample_rate: u32,
        samples: SampleProducer,
    ) -> CaptureResult<Box<dyn ActiveInput>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushMode {
    Available,
    Unavailable,
    Denied,
}

/// Input fed from application code through a [`PushInputFeeder`].
///
/// Used for piping audio from files or other processes, and in tests.
pub struct PushInputDevice {
    slot: Arc<Mutex<Option<SampleProducer>>>,
    mode: PushMode,
}

/// Writer half of a [`PushInputDevice`].
#[derive(Clone)]
pub struct PushInputFeeder {
    slot: Arc<Mutex<Option<SampleProducer>>>,
}

impl PushInputDevice {
    pub fn new() -> (Self, PushInputFeeder) {
        Self::with_mode(PushMode::Available)
    }

    /// A device whose `open` always fails as if no microphone is present.
    pub fn unavailable() -> (Self, PushInputFeeder) {
        Self::with_mode(PushMode::Unavailable)
    }

    /// A device whose `open` always fails as if the user refused access.
    pub fn denied() -> (Self, PushInputFeeder) {
        Self::with_mode(PushMode::Denied)
    }

    fn with_mode(mode: PushMode) -> (Self, PushInputFeeder) {
        let slot = Arc::new(Mutex::new(None));
        (
            Self {
                slot: slot.clone(),
                mode,
            },
            PushInputFeeder { slot },
        )
    }
}

#[async_trait]
impl AudioInputDevice for PushInputDevice {
    async fn open(
        &mut self,
        _sample_rate: u32,
        samples: SampleProducer,
    ) -> CaptureResult<Box<dyn ActiveInput>> {
        match self.mode {
            PushMode::Unavailable => {
                return Err(CaptureError::DeviceUnavailable(
                    "no input device".to_string(),
                ));
            }
            PushMode::Denied => {
                return Err(CaptureError::PermissionDenied(
                    "access refused".to_string(),
                ));
            }
            PushMode::Available => {}
        }
        *self.slot.lock() = Some(samples);
        Ok(Box::new(PushInput {
            slot: self.slot.clone(),
        }))
    }
}

struct PushInput {
    slot: Arc<Mutex<Option<SampleProducer>>>,
}

impl ActiveInput for PushInput {
    fn close(&mut self) {
        self.slot.lock().take();
    }
}

impl Drop for PushInput {
    fn drop(&mut self) {
        self.close();
    }
}

impl PushInputFeeder {
    /// Write samples into the open stream. Returns how many were accepted;
    /// zero while the device is closed.
    pub fn push(&self, samples: &[f32]) -> usize {
        match self.slot.lock().as_mut() {
            Some(producer) => producer.push(samples),
            None => 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.slot.lock().is_some()
    }
}
