//! Band-energy voice activity detection.
//!
//! Each frame is windowed and transformed with an FFT; the power inside the
//! voice band is summed into a few sub-bands. The first `calibration_ms` of a
//! capture average into a per-band noise floor. After that a frame is voiced
//! when any sub-band exceeds its floor by the threshold multiplier.

use std::f32::consts::PI;
use std::fmt;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use super::config::CaptureConfig;

/// Floor used when calibration heard digital silence.
const MIN_NOISE_FLOOR: f32 = 1e-9;

/// Per-frame sub-band energies within the voice band.
pub struct BandEnergyAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    /// Half-open bin ranges, one per sub-band
    bands: Vec<(usize, usize)>,
}

impl BandEnergyAnalyzer {
    pub fn new(config: &CaptureConfig) -> Self {
        let size = config.frame_samples;
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        // Hann
        let window = (0..size)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / size as f32).cos())
            .collect();

        let bin_hz = config.sample_rate as f32 / size as f32;
        let width = (config.band_high_hz - config.band_low_hz) / config.sub_bands as f32;
        let bands = (0..config.sub_bands)
            .map(|b| {
                let low = config.band_low_hz + width * b as f32;
                let high = low + width;
                let first = (low / bin_hz).ceil() as usize;
                let last = ((high / bin_hz).ceil() as usize).min(size / 2 + 1);
                (first.min(last), last)
            })
            .collect();

        Self {
            fft,
            window,
            buffer: vec![Complex::new(0.0, 0.0); size],
            scratch,
            bands,
        }
    }

    pub fn sub_bands(&self) -> usize {
        self.bands.len()
    }

    /// Mean power per sub-band. Short frames are zero padded.
    pub fn energies(&mut self, frame: &[f32]) -> Vec<f32> {
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = frame.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        let size = self.buffer.len() as f32;
        self.bands
            .iter()
            .map(|&(first, last)| {
                if last <= first {
                    return 0.0;
                }
                let power: f32 = self.buffer[first..last]
                    .iter()
                    .map(|c| c.norm_sqr() / size)
                    .sum();
                power / (last - first) as f32
            })
            .collect()
    }
}

/// Voice state changes reported by [`VoiceGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    /// First voiced frame after silence; `at_ms` is the frame start
    VoiceStart { at_ms: u64 },
    /// Configured silence elapsed after the last voiced frame
    SilenceDetected { at_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Calibrating,
    Silence,
    Voice,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateState::Calibrating => write!(f, "Calibrating"),
            GateState::Silence => write!(f, "Silence"),
            GateState::Voice => write!(f, "Voice"),
        }
    }
}

/// Decides voice/silence from sub-band energies on a millisecond timeline
/// measured from capture start.
#[derive(Debug, Clone)]
pub struct VoiceGate {
    calibration_ms: u64,
    silence_ms: u64,
    multiplier: f32,
    floor_sum: Vec<f64>,
    floor_frames: u32,
    noise_floor: Option<Vec<f32>>,
    last_voiced_end_ms: u64,
    state: GateState,
}

impl VoiceGate {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            calibration_ms: config.calibration_ms,
            silence_ms: config.silence_duration_ms,
            multiplier: config.threshold_multiplier,
            floor_sum: vec![0.0; config.sub_bands],
            floor_frames: 0,
            noise_floor: None,
            last_voiced_end_ms: 0,
            state: GateState::Calibrating,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == GateState::Voice
    }

    pub fn noise_floor(&self) -> Option<&[f32]> {
        self.noise_floor.as_deref()
    }

    /// Feed one frame covering `[start_ms, end_ms)`.
    pub fn process_energies(
        &mut self,
        start_ms: u64,
        end_ms: u64,
        energies: &[f32],
    ) -> Option<VadTransition> {
        if start_ms < self.calibration_ms {
            for (sum, &e) in self.floor_sum.iter_mut().zip(energies) {
                *sum += e as f64;
            }
            self.floor_frames += 1;
            return None;
        }

        let floor = self.noise_floor.get_or_insert_with(|| {
            let frames = self.floor_frames.max(1) as f64;
            self.floor_sum
                .iter()
                .map(|&sum| ((sum / frames) as f32).max(MIN_NOISE_FLOOR))
                .collect()
        });
        if self.state == GateState::Calibrating {
            tracing::debug!("VAD calibrated: noise floor {:?}", floor);
            self.state = GateState::Silence;
        }

        let voiced = energies
            .iter()
            .zip(floor.iter())
            .any(|(&e, &f)| e > f * self.multiplier);

        if voiced {
            self.last_voiced_end_ms = end_ms;
            if self.state != GateState::Voice {
                self.state = GateState::Voice;
                return Some(VadTransition::VoiceStart { at_ms: start_ms });
            }
        } else if self.state == GateState::Voice
            && end_ms >= self.last_voiced_end_ms + self.silence_ms
        {
            self.state = GateState::Silence;
            return Some(VadTransition::SilenceDetected { at_ms: end_ms });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CaptureConfig {
        CaptureConfig {
            frame_samples: 160,
            calibration_ms: 1000,
            silence_duration_ms: 2000,
            ..Default::default()
        }
    }

    fn tone(freq: f32, amplitude: f32, len: usize, rate: u32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_in_band_tone_dominates_energy() {
        let config = CaptureConfig::default();
        let mut analyzer = BandEnergyAnalyzer::new(&config);
        assert_eq!(analyzer.sub_bands(), 4);

        let voiced = analyzer.energies(&tone(1000.0, 0.5, 2048, 16000));
        let quiet = analyzer.energies(&tone(1000.0, 0.005, 2048, 16000));
        let out_of_band = analyzer.energies(&tone(6000.0, 0.5, 2048, 16000));

        let max = |v: &[f32]| v.iter().cloned().fold(0.0f32, f32::max);
        assert!(max(&voiced) > 1000.0 * max(&quiet));
        assert!(max(&voiced) > 100.0 * max(&out_of_band));
    }

    #[test]
    fn test_short_frame_is_zero_padded() {
        let mut analyzer = BandEnergyAnalyzer::new(&CaptureConfig::default());
        let energies = analyzer.energies(&tone(1000.0, 0.5, 500, 16000));
        assert_eq!(energies.len(), 4);
        assert!(energies.iter().any(|&e| e > 0.0));
    }

    /// Walks a 10ms-frame timeline: calibrate on noise, then voice over
    /// `[voice_from, voice_to)`, then silence.
    fn run_trace(voice_from: u64, voice_to: u64, until: u64) -> Vec<VadTransition> {
        let mut gate = VoiceGate::new(&config());
        let noise = [1.0f32; 4];
        let voice = [1.0, 50.0, 1.0, 1.0];
        let mut transitions = Vec::new();
        let mut t = 0;
        while t < until {
            let energies = if t >= voice_from && t < voice_to {
                &voice
            } else {
                &noise
            };
            if let Some(tr) = gate.process_energies(t, t + 10, energies) {
                transitions.push(tr);
            }
            t += 10;
        }
        transitions
    }

    #[test]
    fn test_voice_trace_fires_start_then_silence() {
        let transitions = run_trace(1500, 2300, 10_000);
        assert_eq!(
            transitions,
            vec![
                VadTransition::VoiceStart { at_ms: 1500 },
                VadTransition::SilenceDetected { at_ms: 4300 },
            ]
        );
    }

    #[test]
    fn test_no_silence_before_duration_elapses() {
        let transitions = run_trace(1500, 2300, 4290);
        assert_eq!(transitions, vec![VadTransition::VoiceStart { at_ms: 1500 }]);
    }

    #[test]
    fn test_voice_during_calibration_is_ignored() {
        let mut gate = VoiceGate::new(&config());
        for t in (0..1000).step_by(10) {
            assert_eq!(gate.process_energies(t, t + 10, &[1.0; 4]), None);
            assert_eq!(gate.state(), GateState::Calibrating);
        }
        assert_eq!(
            gate.process_energies(1000, 1010, &[1.0; 4]),
            None
        );
        assert_eq!(gate.state(), GateState::Silence);
        assert_eq!(gate.noise_floor().unwrap(), &[1.0; 4]);
    }

    #[test]
    fn test_below_threshold_stays_silent() {
        let transitions = {
            let mut gate = VoiceGate::new(&config());
            let mut out = Vec::new();
            for t in (0..5000).step_by(10) {
                if let Some(tr) = gate.process_energies(t, t + 10, &[1.0, 2.9, 1.0, 1.0]) {
                    out.push(tr);
                }
            }
            out
        };
        assert!(transitions.is_empty());
    }
}
