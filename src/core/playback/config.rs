//! Playback scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::sink::{PlaybackError, PlaybackResult};

/// Model audio arrives as 24kHz PCM16.
pub const DEFAULT_PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Samples per ready buffer (320ms at 24kHz).
pub const DEFAULT_BUFFER_SAMPLES: usize = 7680;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Sample rate of incoming PCM16
    pub sample_rate: u32,

    /// Samples per scheduled buffer
    pub buffer_samples: usize,

    /// Jitter buffer applied when playback (re)starts, seconds
    pub initial_buffer_delay: f64,

    /// Only schedule buffers starting within this window of the output clock, seconds
    pub schedule_ahead: f64,

    /// Fade-to-silence duration on stop, seconds
    pub fade_out: f64,

    /// Periodic scheduling pass interval
    pub tick_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_PLAYBACK_SAMPLE_RATE,
            buffer_samples: DEFAULT_BUFFER_SAMPLES,
            initial_buffer_delay: 0.1,
            schedule_ahead: 0.2,
            fade_out: 0.1,
            tick_interval_ms: 100,
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> PlaybackResult<()> {
        if self.sample_rate == 0 {
            return Err(PlaybackError::InvalidConfiguration(
                "sample_rate must be positive".to_string(),
            ));
        }
        if self.buffer_samples == 0 {
            return Err(PlaybackError::InvalidConfiguration(
                "buffer_samples must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("initial_buffer_delay", self.initial_buffer_delay),
            ("schedule_ahead", self.schedule_ahead),
            ("fade_out", self.fade_out),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(PlaybackError::InvalidConfiguration(format!(
                    "{} must be a non-negative number of seconds, got {}",
                    name, value
                )));
            }
        }
        if self.tick_interval_ms == 0 {
            return Err(PlaybackError::InvalidConfiguration(
                "tick_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Bytes of PCM16 in one full buffer.
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_samples * 2
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
