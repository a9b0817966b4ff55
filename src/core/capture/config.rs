//! Capture pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::device::{CaptureError, CaptureResult};
use crate::core::audio::DEFAULT_SAMPLE_RING_CAPACITY;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sample rate frames are produced at (Hz)
    pub sample_rate: u32,

    /// Samples per emitted frame (2048 = 128ms at 16kHz)
    pub frame_samples: usize,

    /// Noise-floor calibration window after `start()` (ms)
    pub calibration_ms: u64,

    /// Lower edge of the voice band (Hz)
    pub band_low_hz: f32,

    /// Upper edge of the voice band (Hz)
    pub band_high_hz: f32,

    /// Number of sub-bands the voice band is split into
    pub sub_bands: usize,

    /// A sub-band is voiced when its energy exceeds `noise_floor * multiplier`
    pub threshold_multiplier: f32,

    /// Silence required after the last voiced frame before `SilenceDetected` (ms)
    pub silence_duration_ms: u64,

    /// Only emit frames while voice is active
    pub gate_frames: bool,

    /// Capacity of the audio-thread ring in samples
    pub ring_capacity: usize,

    /// How often the control task drains the ring (ms)
    pub drain_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_samples: 2048,
            calibration_ms: 1000,
            band_low_hz: 300.0,
            band_high_hz: 3400.0,
            sub_bands: 4,
            threshold_multiplier: 3.0,
            silence_duration_ms: 2000,
            gate_frames: true,
            ring_capacity: DEFAULT_SAMPLE_RING_CAPACITY,
            drain_interval_ms: 20,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> CaptureResult<()> {
        if self.sample_rate == 0 {
            return Err(CaptureError::InvalidConfiguration(
                "sample_rate must be positive".to_string(),
            ));
        }
        if self.frame_samples < 16 {
            return Err(CaptureError::InvalidConfiguration(format!(
                "frame_samples must be at least 16, got {}",
                self.frame_samples
            )));
        }
        let nyquist = self.sample_rate as f32 / 2.0;
        if !(self.band_low_hz >= 0.0
            && self.band_low_hz < self.band_high_hz
            && self.band_high_hz <= nyquist)
        {
            return Err(CaptureError::InvalidConfiguration(format!(
                "voice band {}-{}Hz must lie within 0-{}Hz",
                self.band_low_hz, self.band_high_hz, nyquist
            )));
        }
        if self.sub_bands == 0 {
            return Err(CaptureError::InvalidConfiguration(
                "sub_bands must be positive".to_string(),
            ));
        }
        if !(self.threshold_multiplier.is_finite() && self.threshold_multiplier >= 1.0) {
            return Err(CaptureError::InvalidConfiguration(format!(
                "threshold_multiplier must be >= 1.0, got {}",
                self.threshold_multiplier
            )));
        }
        if self.ring_capacity < self.frame_samples {
            return Err(CaptureError::InvalidConfiguration(
                "ring_capacity must hold at least one frame".to_string(),
            ));
        }
        if self.drain_interval_ms == 0 {
            return Err(CaptureError::InvalidConfiguration(
                "drain_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Frame duration in milliseconds.
    pub fn frame_ms(&self) -> f64 {
        self.frame_samples as f64 * 1000.0 / self.sample_rate as f64
    }
}
