//! Audio primitives shared by capture and playback.
//!
//! - [`pcm`]: PCM16 quantization, base64 framing, resampling
//! - [`ring`]: wait-free SPSC sample rings crossing the audio-thread boundary

pub mod pcm;
pub mod ring;

pub use pcm::{
    LinearResampler, decode_frame, decode_pcm16, encode_frame, encode_pcm16, pcm16_mime_type,
    rms, sample_rate_from_mime,
};
pub use ring::{DEFAULT_SAMPLE_RING_CAPACITY, SampleConsumer, SampleProducer, sample_ring};
