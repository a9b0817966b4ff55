//! Microphone capture pipeline.
//!
//! ```text
//! device callback -> SampleRing -> drain task -> FrameProcessor -> CaptureEvents
//! ```
//!
//! The device writes into a wait-free ring. A tokio task drains it on a
//! fixed interval and runs the [`FrameProcessor`]: framing, volume, voice
//! detection, gating and base64 encoding all happen off the audio thread.

use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::CaptureConfig;
use super::device::{ActiveInput, AudioInputDevice, CaptureResult};
use super::vad::{BandEnergyAnalyzer, VadTransition, VoiceGate};
use crate::core::audio::{SampleConsumer, encode_frame, encode_pcm16, rms, sample_ring};
use crate::core::session::EncodedFrame;

/// Output of the capture pipeline, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// A base64 PCM16 frame ready for `send_realtime_frame`
    FrameReady(EncodedFrame),
    /// RMS level of the latest frame, 0.0..=1.0
    Volume(f32),
    VoiceStart { at_ms: u64 },
    SilenceDetected { at_ms: u64 },
}

/// Receiver for [`CaptureEvent`]s.
#[derive(Debug)]
pub struct CaptureEvents {
    rx: mpsc::UnboundedReceiver<CaptureEvent>,
}

impl CaptureEvents {
    pub async fn recv(&mut self) -> Option<CaptureEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CaptureEvent> {
        self.rx.try_recv().ok()
    }
}

/// Turns raw samples into frames and voice events. Synchronous and
/// deterministic; time is derived from the sample count.
pub struct FrameProcessor {
    config: CaptureConfig,
    analyzer: BandEnergyAnalyzer,
    gate: VoiceGate,
    pending: Vec<f32>,
    samples_processed: u64,
    seq: u64,
    replay: BytesMut,
}

impl FrameProcessor {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            analyzer: BandEnergyAnalyzer::new(&config),
            gate: VoiceGate::new(&config),
            pending: Vec::with_capacity(config.frame_samples * 2),
            samples_processed: 0,
            seq: 0,
            replay: BytesMut::new(),
            config,
        }
    }

    pub fn gate(&self) -> &VoiceGate {
        &self.gate
    }

    /// Append samples, processing every complete frame.
    pub fn push_samples(&mut self, samples: &[f32], out: &mut Vec<CaptureEvent>) {
        self.pending.extend_from_slice(samples);
        let size = self.config.frame_samples;
        let mut offset = 0;
        while self.pending.len() - offset >= size {
            let frame = self.pending[offset..offset + size].to_vec();
            self.process_frame(&frame, out);
            offset += size;
        }
        self.pending.drain(..offset);
    }

    /// Process whatever partial frame remains.
    pub fn flush(&mut self, out: &mut Vec<CaptureEvent>) {
        if self.pending.is_empty() {
            return;
        }
        let frame = std::mem::take(&mut self.pending);
        self.process_frame(&frame, out);
    }

    /// PCM16 of every frame processed so far; clears the buffer.
    pub fn take_replay(&mut self) -> Bytes {
        self.replay.split().freeze()
    }

    fn process_frame(&mut self, frame: &[f32], out: &mut Vec<CaptureEvent>) {
        let rate = self.config.sample_rate as u64;
        let start_ms = self.samples_processed * 1000 / rate;
        let end_ms = (self.samples_processed + frame.len() as u64) * 1000 / rate;
        self.samples_processed += frame.len() as u64;

        let pcm = encode_pcm16(frame);
        self.replay.extend_from_slice(&pcm);
        out.push(CaptureEvent::Volume(rms(frame).min(1.0)));

        let was_active = self.gate.is_active();
        let energies = self.analyzer.energies(frame);
        let transition = self.gate.process_energies(start_ms, end_ms, &energies);

        if let Some(VadTransition::VoiceStart { at_ms }) = transition {
            debug!("Voice start at {}ms", at_ms);
            out.push(CaptureEvent::VoiceStart { at_ms });
        }

        if !self.config.gate_frames || was_active || self.gate.is_active() {
            out.push(CaptureEvent::FrameReady(EncodedFrame {
                seq: self.seq,
                sample_rate: self.config.sample_rate,
                data: encode_frame(&pcm),
            }));
            self.seq += 1;
        }

        if let Some(VadTransition::SilenceDetected { at_ms }) = transition {
            debug!("Silence detected at {}ms", at_ms);
            out.push(CaptureEvent::SilenceDetected { at_ms });
        }
    }
}

struct RunningCapture {
    input: Box<dyn ActiveInput>,
    cancel: CancellationToken,
    drain: JoinHandle<FrameProcessor>,
}

struct CaptureInner {
    device: Box<dyn AudioInputDevice>,
    running: Option<RunningCapture>,
}

/// Microphone capture with voice detection.
///
/// `start` and `stop` are serialized; overlapping calls wait for each other
/// and repeated calls are no-ops.
pub struct AudioCapture {
    config: CaptureConfig,
    inner: Mutex<CaptureInner>,
    events: mpsc::UnboundedSender<CaptureEvent>,
}

impl AudioCapture {
    pub fn new<D: AudioInputDevice>(
        config: CaptureConfig,
        device: D,
    ) -> CaptureResult<(Self, CaptureEvents)> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                config,
                inner: Mutex::new(CaptureInner {
                    device: Box::new(device),
                    running: None,
                }),
                events: tx,
            },
            CaptureEvents { rx },
        ))
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.running.is_some()
    }

    /// Open the device and begin producing events. Each start recalibrates
    /// the noise floor.
    pub async fn start(&self) -> CaptureResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.running.is_some() {
            debug!("Capture already running");
            return Ok(());
        }

        let (producer, consumer) = sample_ring(self.config.ring_capacity);
        let input = inner
            .device
            .open(self.config.sample_rate, producer)
            .await?;

        let cancel = CancellationToken::new();
        let drain = tokio::spawn(drain_loop(
            consumer,
            FrameProcessor::new(self.config.clone()),
            self.events.clone(),
            self.config.clone(),
            cancel.clone(),
        ));

        info!(
            "Capture started ({}Hz, {} samples per frame)",
            self.config.sample_rate, self.config.frame_samples
        );
        inner.running = Some(RunningCapture {
            input,
            cancel,
            drain,
        });
        Ok(())
    }

    /// Stop the device and return the PCM16 of everything captured since
    /// `start`. Empty when not running.
    pub async fn stop(&self) -> Bytes {
        let mut inner = self.inner.lock().await;
        let Some(mut running) = inner.running.take() else {
            return Bytes::new();
        };

        running.input.close();
        running.cancel.cancel();
        match running.drain.await {
            Ok(mut processor) => {
                let replay = processor.take_replay();
                info!("Capture stopped ({} bytes captured)", replay.len());
                replay
            }
            Err(e) => {
                warn!("Capture drain task failed: {}", e);
                Bytes::new()
            }
        }
    }
}

async fn drain_loop(
    mut consumer: SampleConsumer,
    mut processor: FrameProcessor,
    events: mpsc::UnboundedSender<CaptureEvent>,
    config: CaptureConfig,
    cancel: CancellationToken,
) -> FrameProcessor {
    let mut ticker = tokio::time::interval(config.drain_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut samples = Vec::with_capacity(config.ring_capacity);
    let mut out = Vec::new();

    loop {
        let stopping = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = ticker.tick() => false,
        };

        samples.clear();
        consumer.drain_into(&mut samples);
        processor.push_samples(&samples, &mut out);
        if stopping {
            processor.flush(&mut out);
        }
        for event in out.drain(..) {
            let _ = events.send(event);
        }
        if stopping {
            break;
        }
    }

    let dropped = consumer.stats().dropped();
    if dropped > 0 {
        warn!("Capture ring overflowed, {} samples dropped", dropped);
    }
    processor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::decode_frame;
    use crate::core::capture::device::{CaptureError, PushInputDevice};
    use std::f32::consts::PI;

    /// 10ms frames at 16kHz.
    fn config() -> CaptureConfig {
        CaptureConfig {
            frame_samples: 160,
            ..Default::default()
        }
    }

    /// One 10ms frame of a 1kHz tone (whole cycles, so frames repeat exactly).
    fn frame(amplitude: f32) -> Vec<f32> {
        (0..160)
            .map(|i| amplitude * (2.0 * PI * 1000.0 * i as f32 / 16000.0).sin())
            .collect()
    }

    /// Quiet until 1500ms, voiced until 2300ms, quiet until `until_ms`.
    fn run_trace(config: CaptureConfig, until_ms: u64) -> (FrameProcessor, Vec<CaptureEvent>) {
        let mut processor = FrameProcessor::new(config);
        let mut out = Vec::new();
        for t in (0..until_ms).step_by(10) {
            let amplitude = if (1500..2300).contains(&t) { 0.5 } else { 0.001 };
            processor.push_samples(&frame(amplitude), &mut out);
        }
        (processor, out)
    }

    fn voice_events(events: &[CaptureEvent]) -> Vec<CaptureEvent> {
        events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    CaptureEvent::VoiceStart { .. } | CaptureEvent::SilenceDetected { .. }
                )
            })
            .cloned()
            .collect()
    }

    #[test]
    fn test_voice_then_silence_trace() {
        let (_, events) = run_trace(config(), 6000);
        assert_eq!(
            voice_events(&events),
            vec![
                CaptureEvent::VoiceStart { at_ms: 1500 },
                CaptureEvent::SilenceDetected { at_ms: 4300 },
            ]
        );
    }

    #[test]
    fn test_silence_not_reported_early() {
        let (_, events) = run_trace(config(), 4290);
        assert_eq!(
            voice_events(&events),
            vec![CaptureEvent::VoiceStart { at_ms: 1500 }]
        );
    }

    #[test]
    fn test_gated_frames_span_voice_start_to_silence() {
        let (_, events) = run_trace(config(), 6000);
        let frames: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::FrameReady(f) => Some(f.seq),
                _ => None,
            })
            .collect();
        // 1500ms..4300ms in 10ms frames
        assert_eq!(frames.len(), 280);
        assert_eq!(frames, (0..280).collect::<Vec<_>>());

        let first = events
            .iter()
            .position(|e| matches!(e, CaptureEvent::FrameReady(_)))
            .unwrap();
        assert!(matches!(events[first - 1], CaptureEvent::VoiceStart { .. }));
        assert!(matches!(
            events.last(),
            Some(CaptureEvent::Volume(_)) | Some(CaptureEvent::SilenceDetected { .. })
        ));
    }

    #[test]
    fn test_ungated_emits_every_frame() {
        let config = CaptureConfig {
            gate_frames: false,
            ..config()
        };
        let (_, events) = run_trace(config, 500);
        let frames = events
            .iter()
            .filter(|e| matches!(e, CaptureEvent::FrameReady(_)))
            .count();
        let volumes = events
            .iter()
            .filter(|e| matches!(e, CaptureEvent::Volume(_)))
            .count();
        assert_eq!(frames, 50);
        assert_eq!(volumes, 50);
    }

    #[test]
    fn test_frame_payload_decodes_to_pcm16() {
        let config = CaptureConfig {
            gate_frames: false,
            ..config()
        };
        let mut processor = FrameProcessor::new(config);
        let mut out = Vec::new();
        processor.push_samples(&frame(0.5), &mut out);
        let CaptureEvent::FrameReady(encoded) = &out[1] else {
            panic!("expected frame, got {:?}", out[1]);
        };
        assert_eq!(encoded.sample_rate, 16000);
        assert_eq!(decode_frame(&encoded.data).unwrap().len(), 320);
    }

    #[test]
    fn test_partial_frame_waits_for_flush() {
        let mut processor = FrameProcessor::new(config());
        let mut out = Vec::new();
        processor.push_samples(&[0.0; 100], &mut out);
        assert!(out.is_empty());
        processor.flush(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(processor.take_replay().len(), 200);
        assert!(processor.take_replay().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_returns_replay() {
        let (device, feeder) = PushInputDevice::new();
        let config = CaptureConfig {
            gate_frames: false,
            ..config()
        };
        let (capture, mut events) = AudioCapture::new(config, device).unwrap();

        capture.start().await.unwrap();
        capture.start().await.unwrap();
        assert!(capture.is_running().await);
        assert_eq!(feeder.push(&vec![0.25; 1000]), 1000);

        let replay = capture.stop().await;
        assert_eq!(replay.len(), 2000);
        assert!(!capture.is_running().await);
        assert!(!feeder.is_open());

        let mut frames = 0;
        while let Some(event) = events.try_recv() {
            if matches!(event, CaptureEvent::FrameReady(_)) {
                frames += 1;
            }
        }
        // six full frames plus the flushed tail
        assert_eq!(frames, 7);

        assert!(capture.stop().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_captures_fresh_replay() {
        let (device, feeder) = PushInputDevice::new();
        let (capture, _events) = AudioCapture::new(config(), device).unwrap();

        capture.start().await.unwrap();
        feeder.push(&[0.1; 320]);
        assert_eq!(capture.stop().await.len(), 640);

        capture.start().await.unwrap();
        feeder.push(&[0.1; 160]);
        assert_eq!(capture.stop().await.len(), 320);
    }

    #[tokio::test]
    async fn test_denied_start_stays_stopped() {
        let (device, _) = PushInputDevice::denied();
        let (capture, _events) = AudioCapture::new(config(), device).unwrap();
        assert!(matches!(
            capture.start().await,
            Err(CaptureError::PermissionDenied(_))
        ));
        assert!(!capture.is_running().await);
    }
}
