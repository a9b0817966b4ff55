//! Microphone input through cpal.
//!
//! Same threading shape as the output sink: a dedicated thread owns the
//! `!Send` stream and parks until the input is closed. The callback converts
//! to mono f32 at the capture rate and writes into the sample ring.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig};
use tokio::sync::oneshot;
use tracing::{error, info};

use super::device::{ActiveInput, AudioInputDevice, CaptureError, CaptureResult};
use crate::core::audio::pcm::downmix_into;
use crate::core::audio::{LinearResampler, SampleProducer};

/// The default system microphone.
#[derive(Debug, Default)]
pub struct CpalInputDevice {
    device_name: Option<String>,
}

impl CpalInputDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefer the input device with this name, falling back to the default.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }
}

#[async_trait]
impl AudioInputDevice for CpalInputDevice {
    async fn open(
        &mut self,
        sample_rate: u32,
        samples: SampleProducer,
    ) -> CaptureResult<Box<dyn ActiveInput>> {
        let (ready_tx, ready_rx) = oneshot::channel::<CaptureResult<u32>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        let thread = std::thread::Builder::new()
            .name("waav-live-input".to_string())
            .spawn(move || {
                let stream = match build_input_stream(device_name, sample_rate, samples) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        let device_rate = ready_rx.await.map_err(|_| {
            CaptureError::Stream("input thread exited before the stream started".to_string())
        })??;
        info!(
            "Input stream open at {}Hz (capturing at {}Hz)",
            device_rate, sample_rate
        );

        Ok(Box::new(CpalInput {
            stop: Some(stop_tx),
            thread: Some(thread),
        }))
    }
}

struct CpalInput {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ActiveInput for CpalInput {
    fn close(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Callback-side conversion state. Buffers are reused between callbacks.
struct InputConverter {
    producer: SampleProducer,
    resampler: LinearResampler,
    channels: usize,
    interleaved: Vec<f32>,
    mono: Vec<f32>,
    resampled: Vec<f32>,
}

impl InputConverter {
    fn process<T: Copy>(&mut self, data: &[T], convert: impl Fn(T) -> f32) {
        self.interleaved.clear();
        self.interleaved.extend(data.iter().map(|&s| convert(s)));
        self.mono.clear();
        downmix_into(&self.interleaved, self.channels, &mut self.mono);
        if self.resampler.is_identity() {
            self.producer.push(&self.mono);
        } else {
            self.resampled.clear();
            self.resampler.process_into(&self.mono, &mut self.resampled);
            self.producer.push(&self.resampled);
        }
    }
}

fn map_build_error(e: cpal::BuildStreamError) -> CaptureError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable(e.to_string())
        }
        other => {
            let message = other.to_string();
            let lower = message.to_lowercase();
            if lower.contains("permission") || lower.contains("denied") {
                CaptureError::PermissionDenied(message)
            } else {
                CaptureError::Stream(message)
            }
        }
    }
}

fn run_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut converter: InputConverter,
    convert: fn(T) -> f32,
) -> CaptureResult<cpal::Stream>
where
    T: SizedSample + Copy + Send + 'static,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| converter.process(data, convert),
            |err| error!("Input stream error: {}", err),
            None,
        )
        .map_err(map_build_error)
}

fn build_input_stream(
    device_name: Option<String>,
    sample_rate: u32,
    producer: SampleProducer,
) -> CaptureResult<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = device_name
        .and_then(|name| {
            host.input_devices()
                .ok()
                .and_then(|mut devices| devices.find(|d| d.name().is_ok_and(|n| n == name)))
        })
        .or_else(|| host.default_input_device())
        .ok_or_else(|| CaptureError::DeviceUnavailable("no input device".to_string()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let device_rate = config.sample_rate.0;
    let channels = config.channels.max(1) as usize;

    let converter = InputConverter {
        producer,
        resampler: LinearResampler::new(device_rate, sample_rate),
        channels,
        interleaved: Vec::with_capacity(16384),
        mono: Vec::with_capacity(8192),
        resampled: Vec::with_capacity(8192),
    };

    let stream = match format {
        SampleFormat::F32 => run_stream::<f32>(&device, &config, converter, |s| s)?,
        SampleFormat::I16 => {
            run_stream::<i16>(&device, &config, converter, |s| s as f32 / 32768.0)?
        }
        SampleFormat::I32 => {
            run_stream::<i32>(&device, &config, converter, |s| s as f32 / i32::MAX as f32)?
        }
        SampleFormat::U16 => run_stream::<u16>(&device, &config, converter, |s| {
            (s as f32 - 32768.0) / 32768.0
        })?,
        other => {
            return Err(CaptureError::DeviceUnavailable(format!(
                "unsupported input sample format {:?}",
                other
            )));
        }
    };

    stream.play().map_err(|e| match e {
        cpal::PlayStreamError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable(e.to_string())
        }
        other => CaptureError::Stream(other.to_string()),
    })?;

    Ok((stream, device_rate))
}
