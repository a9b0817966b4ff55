//! Speaker output through cpal.
//!
//! The cpal stream is `!Send`, so a dedicated thread owns it for its whole
//! life. Scheduled buffers reach the output callback through an `rtrb`
//! command ring; the callback keeps the output clock as a frame counter.
//! Mixing happens in f32 and is converted to the device's sample format.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{error, info, warn};

use super::sink::{AudioSink, PlaybackError, PlaybackResult};
use crate::core::audio::pcm::{self, LinearResampler};

/// Pending commands between the control side and the output callback.
const COMMAND_RING_CAPACITY: usize = 256;

/// Voices the callback mixes at once before new ones are dropped.
const MAX_VOICES: usize = 64;

/// Preallocated f32 mix buffer for non-f32 devices.
const MIX_CAPACITY: usize = 16384;

enum SinkCommand {
    Play { start_frame: u64, samples: Vec<f32> },
    FadeOut { frames: u64 },
    Gain(f32),
}

struct Voice {
    start_frame: u64,
    samples: Vec<f32>,
    /// (fade start frame, fade length) once fading
    fade: Option<(u64, u64)>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Output callback state. Lives on the audio thread only.
struct Renderer {
    commands: Consumer<SinkCommand>,
    voices: Vec<Voice>,
    frames_played: Arc<AtomicU64>,
    gain: f32,
    channels: usize,
    mix: Vec<f32>,
}

impl Renderer {
    fn new(
        commands: Consumer<SinkCommand>,
        frames_played: Arc<AtomicU64>,
        channels: usize,
    ) -> Self {
        Self {
            commands,
            voices: Vec::with_capacity(MAX_VOICES),
            frames_played,
            gain: 1.0,
            channels: channels.max(1),
            mix: Vec::with_capacity(MIX_CAPACITY),
        }
    }

    fn apply_commands(&mut self, now: u64) {
        while let Ok(command) = self.commands.pop() {
            match command {
                SinkCommand::Play {
                    start_frame,
                    samples,
                } => {
                    if self.voices.len() < MAX_VOICES {
                        self.voices.push(Voice {
                            start_frame,
                            samples,
                            fade: None,
                        });
                    }
                }
                SinkCommand::FadeOut { frames } => {
                    // Voices that have not started yet are dropped outright.
                    self.voices.retain(|v| v.start_frame < now);
                    for voice in &mut self.voices {
                        if voice.fade.is_none() {
                            voice.fade = Some((now, frames.max(1)));
                        }
                    }
                }
                SinkCommand::Gain(gain) => self.gain = gain,
            }
        }
    }

    fn render(&mut self, output: &mut [f32]) {
        let now = self.frames_played.load(Ordering::Relaxed);
        self.apply_commands(now);

        let frames = output.len() / self.channels;
        for (i, frame) in output.chunks_exact_mut(self.channels).enumerate() {
            let position = now + i as u64;
            let mut mixed = 0.0f32;
            for voice in &self.voices {
                if position < voice.start_frame || position >= voice.end_frame() {
                    continue;
                }
                let sample = voice.samples[(position - voice.start_frame) as usize];
                let level = match voice.fade {
                    Some((start, len)) => {
                        let elapsed = position.saturating_sub(start);
                        (1.0 - elapsed as f32 / len as f32).max(0.0)
                    }
                    None => self.gain,
                };
                mixed += sample * level;
            }
            frame.fill(mixed.clamp(-1.0, 1.0));
        }

        let end = now + frames as u64;
        self.voices.retain(|v| {
            let faded = v.fade.is_some_and(|(start, len)| end >= start + len);
            v.end_frame() > end && !faded
        });
        self.frames_played.store(end, Ordering::Relaxed);
    }

    /// Mix in f32, then convert into a device buffer of another format.
    fn render_as<T: Copy>(&mut self, output: &mut [T], convert: fn(f32) -> T) {
        let mut mix = std::mem::take(&mut self.mix);
        mix.clear();
        mix.resize(output.len(), 0.0);
        self.render(&mut mix);
        for (out, &sample) in output.iter_mut().zip(mix.iter()) {
            *out = convert(sample);
        }
        self.mix = mix;
    }
}

fn to_i32(sample: f32) -> i32 {
    (f64::from(sample.clamp(-1.0, 1.0)) * f64::from(i32::MAX)).round() as i32
}

fn to_u16(sample: f32) -> u16 {
    (i32::from(pcm::quantize_sample(sample)) + 32768) as u16
}

/// Default output device as an [`AudioSink`].
pub struct CpalSink {
    commands: Producer<SinkCommand>,
    frames_played: Arc<AtomicU64>,
    device_rate: u32,
    stream_rate: u32,
    resampler: LinearResampler,
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    failed: Arc<AtomicBool>,
}

impl CpalSink {
    /// Open the default output device for audio at `stream_rate`.
    pub fn open(stream_rate: u32) -> PlaybackResult<Self> {
        let (producer, consumer) = RingBuffer::new(COMMAND_RING_CAPACITY);
        let frames_played = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::channel::<PlaybackResult<u32>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let clock = frames_played.clone();
        let stream_failed = failed.clone();
        let thread = std::thread::Builder::new()
            .name("waav-live-output".to_string())
            .spawn(move || {
                let stream = match build_output_stream(consumer, clock, stream_failed) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Keep the stream alive until the sink is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| PlaybackError::Stream(e.to_string()))?;

        let device_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(PlaybackError::Stream(
                    "output thread exited before the stream started".to_string(),
                ));
            }
        };

        info!(
            "Output stream open at {}Hz (stream audio {}Hz)",
            device_rate, stream_rate
        );

        Ok(Self {
            commands: producer,
            frames_played,
            device_rate,
            stream_rate,
            resampler: LinearResampler::new(stream_rate, device_rate),
            stop: Some(stop_tx),
            thread: Some(thread),
            failed,
        })
    }

    fn send(&mut self, command: SinkCommand) -> PlaybackResult<()> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(PlaybackError::Stream("output stream failed".to_string()));
        }
        self.commands
            .push(command)
            .map_err(|_| PlaybackError::Stream("output command ring full".to_string()))
    }
}

impl AudioSink for CpalSink {
    fn current_time(&self) -> f64 {
        self.frames_played.load(Ordering::Relaxed) as f64 / self.device_rate as f64
    }

    fn sample_rate(&self) -> u32 {
        self.stream_rate
    }

    fn schedule(&mut self, start_time: f64, samples: Vec<f32>) -> PlaybackResult<()> {
        let samples = if self.resampler.is_identity() {
            samples
        } else {
            self.resampler.process(&samples)
        };
        let start_frame = (start_time * self.device_rate as f64).round() as u64;
        self.send(SinkCommand::Play {
            start_frame,
            samples,
        })
    }

    fn fade_out_and_clear(&mut self, duration: f64) {
        self.resampler.reset();
        let frames = (duration * self.device_rate as f64).round() as u64;
        if let Err(e) = self.send(SinkCommand::FadeOut { frames }) {
            warn!("Failed to fade output: {}", e);
        }
    }

    fn set_gain(&mut self, gain: f32) {
        if let Err(e) = self.send(SinkCommand::Gain(gain)) {
            warn!("Failed to set output gain: {}", e);
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_output_stream(
    commands: Consumer<SinkCommand>,
    frames_played: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
) -> PlaybackResult<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlaybackError::DeviceUnavailable("no output device".to_string()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let rate = config.sample_rate.0;
    let renderer = Renderer::new(commands, frames_played, config.channels as usize);

    let stream = match format {
        SampleFormat::F32 => run_stream::<f32>(&device, &config, renderer, failed, |r, out| {
            r.render(out)
        })?,
        SampleFormat::I16 => run_stream::<i16>(&device, &config, renderer, failed, |r, out| {
            r.render_as(out, pcm::quantize_sample)
        })?,
        SampleFormat::I32 => run_stream::<i32>(&device, &config, renderer, failed, |r, out| {
            r.render_as(out, to_i32)
        })?,
        SampleFormat::U16 => run_stream::<u16>(&device, &config, renderer, failed, |r, out| {
            r.render_as(out, to_u16)
        })?,
        other => {
            return Err(PlaybackError::DeviceUnavailable(format!(
                "unsupported output sample format {:?}",
                other
            )));
        }
    };
    stream
        .play()
        .map_err(|e| PlaybackError::Stream(e.to_string()))?;

    Ok((stream, rate))
}

fn run_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut renderer: Renderer,
    failed: Arc<AtomicBool>,
    render: fn(&mut Renderer, &mut [T]),
) -> PlaybackResult<cpal::Stream>
where
    T: SizedSample + Send + 'static,
{
    device
        .build_output_stream(
            config,
            move |output: &mut [T], _: &cpal::OutputCallbackInfo| render(&mut renderer, output),
            move |err| {
                error!("Output stream error: {}", err);
                failed.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                PlaybackError::DeviceUnavailable(e.to_string())
            }
            other => PlaybackError::Stream(other.to_string()),
        })
}
