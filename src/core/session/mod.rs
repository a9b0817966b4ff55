//! Session Protocol State Machine.
//!
//! Full-duplex session with a remote generative service over one WebSocket:
//! setup handshake, framed JSON records both ways, and a typed event channel
//! for the application.
//!
//! # Audio Format
//!
//! Microphone audio is sent as PCM16 mono at 16kHz; model audio arrives as
//! PCM16 mono at 24kHz. Both travel base64 encoded inside JSON.

mod base;
pub mod client;
pub mod config;
pub mod messages;

pub use base::{
    ActivityMarker, AudioChunk, Content, ContentPart, EncodedFrame, FunctionCall,
    FunctionResponse, LiveError, LiveResult, LogDirection, LogEntry, SessionEvent, SessionEvents,
    SessionState, TranscriptionSource,
};
pub use client::LiveSession;
pub use config::{
    DEFAULT_ENDPOINT, DEFAULT_INPUT_SAMPLE_RATE, DEFAULT_MODEL, FunctionDeclaration,
    GenerationConfig, Modality, SessionConfig,
};
pub use messages::{IncomingMessage, OutgoingMessage, ServerContent, parse_incoming};
