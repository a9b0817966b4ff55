//! PCM16 sample conversion and base64 framing.
//!
//! All audio crossing the wire is 16-bit signed little-endian mono PCM,
//! base64 encoded inside JSON records. Internally the capture and playback
//! paths work on normalized `f32` samples in `[-1.0, 1.0]`.

use base64::prelude::*;

/// MIME type prefix used for inline PCM16 audio on the wire.
pub const PCM16_MIME_PREFIX: &str = "audio/pcm";

/// Build the MIME type advertised for PCM16 audio at the given rate.
pub fn pcm16_mime_type(sample_rate: u32) -> String {
    format!("{};rate={}", PCM16_MIME_PREFIX, sample_rate)
}

/// Parse the sample rate out of a `audio/pcm;rate=NNNN` MIME type.
///
/// Returns `None` for non-PCM MIME types. A PCM MIME type without a rate
/// parameter yields `None` as well; callers fall back to their configured rate.
pub fn sample_rate_from_mime(mime_type: &str) -> Option<u32> {
    let mut pieces = mime_type.split(';');
    if pieces.next()?.trim() != PCM16_MIME_PREFIX {
        return None;
    }
    pieces
        .filter_map(|p| p.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
}

/// Quantize a normalized sample to 16-bit signed PCM.
#[inline]
pub fn quantize_sample(sample: f32) -> i16 {
    // Symmetric scale so normalize -> quantize is the identity on every i16.
    (sample.clamp(-1.0, 1.0) * 32768.0)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert a 16-bit signed PCM sample to a normalized float.
#[inline]
pub fn normalize_sample(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Quantize normalized samples into PCM16 little-endian bytes, appending to `out`.
pub fn encode_pcm16_into(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&quantize_sample(sample).to_le_bytes());
    }
}

/// Quantize normalized samples into PCM16 little-endian bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    encode_pcm16_into(samples, &mut out);
    out
}

/// Decode PCM16 little-endian bytes into normalized samples, appending to `out`.
///
/// A trailing odd byte is ignored; streaming callers that may split a sample
/// across chunks carry it themselves.
pub fn decode_pcm16_into(bytes: &[u8], out: &mut Vec<f32>) {
    out.reserve(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        out.push(normalize_sample(i16::from_le_bytes([pair[0], pair[1]])));
    }
}

/// Decode PCM16 little-endian bytes into normalized samples.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    let mut out = Vec::with_capacity(bytes.len() / 2);
    decode_pcm16_into(bytes, &mut out);
    out
}

/// Base64-encode a PCM16 frame for the wire.
pub fn encode_frame(pcm: &[u8]) -> String {
    BASE64_STANDARD.encode(pcm)
}

/// Decode a base64 PCM16 frame from the wire.
pub fn decode_frame(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64_STANDARD.decode(data)
}

/// Root-mean-square level of a block of normalized samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Downmix interleaved multi-channel samples to mono by averaging,
/// appending to `out`. A trailing partial frame is dropped.
pub fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

/// Linear-interpolation resampler for mono streams.
///
/// Keeps the fractional read position between calls so a stream can be
/// resampled chunk by chunk without seams.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    position: f64,
    last: Option<f32>,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            position: 0.0,
            last: None,
        }
    }

    /// Whether the resampler is a pass-through.
    pub fn is_identity(&self) -> bool {
        self.from_rate == self.to_rate
    }

    /// Resample one chunk, appending the output to `out`.
    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.is_identity() {
            out.extend_from_slice(input);
            return;
        }
        if input.is_empty() {
            return;
        }

        let step = self.from_rate as f64 / self.to_rate as f64;
        // Index -1 refers to the last sample of the previous chunk.
        let sample_at = |idx: isize, last: Option<f32>| -> f32 {
            if idx < 0 {
                last.unwrap_or(input[0])
            } else {
                input[idx as usize]
            }
        };

        let offset = if self.last.is_some() { -1.0 } else { 0.0 };
        let mut pos = self.position + offset;
        let limit = input.len() as f64 - 1.0;
        while pos <= limit {
            let base = pos.floor();
            let frac = (pos - base) as f32;
            let a = sample_at(base as isize, self.last);
            let b = if base + 1.0 <= limit {
                sample_at(base as isize + 1, self.last)
            } else {
                a
            };
            out.push(a + (b - a) * frac);
            pos += step;
        }

        // Carry the read position relative to the start of the next chunk.
        self.position = pos - limit;
        self.last = input.last().copied();
    }

    /// Resample one chunk.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let mut out = Vec::new();
        self.process_into(input, &mut out);
        out
    }

    pub fn reset(&mut self) {
        self.position = 0.0;
        self.last = None;
    }
}
