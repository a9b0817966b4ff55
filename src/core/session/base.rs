//! Core types for live multimodal sessions.
//!
//! Errors, the session state machine states, content parts, tool-call
//! records and the typed event surface handed to the application.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::audio::pcm;
use crate::core::turn::Turn;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum LiveError {
    /// Socket-level failure before the connection opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Malformed or unexpected frame from the service
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Attempted send while the session is not active
    #[error("Send rejected: session is {state}")]
    SendRejected { state: SessionState },

    /// Socket failure after the connection opened
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Tool response ids do not match an outstanding tool call
    #[error("Tool response mismatch: {0}")]
    ToolResponseMismatch(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

/// Result type for session operations.
pub type LiveResult<T> = Result<T, LiveError>;

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    AwaitingSetupAck,
    Active,
    Closing,
    Closed,
    Error,
}

impl SessionState {
    /// Whether a connection exists or is being established.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AwaitingSetupAck | Self::Active | Self::Closing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingSetupAck => "awaiting_setup_ack",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Content
// =============================================================================

/// One piece of model or user content.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    InlineAudio { mime_type: String, data: Bytes },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// PCM16 audio at the given sample rate.
    pub fn pcm16(sample_rate: u32, data: impl Into<Bytes>) -> Self {
        Self::InlineAudio {
            mime_type: pcm::pcm16_mime_type(sample_rate),
            data: data.into(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::InlineAudio { .. } => None,
        }
    }

    /// Whether this part carries PCM audio destined for playback.
    pub fn is_pcm_audio(&self) -> bool {
        matches!(self, Self::InlineAudio { mime_type, .. } if mime_type.starts_with(pcm::PCM16_MIME_PREFIX))
    }
}

/// A client-authored turn sent with `send`.
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub role: String,
    pub parts: Vec<ContentPart>,
}

impl Content {
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            role: "user".to_string(),
            parts,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentPart::text(text)])
    }
}

/// Raw PCM16 audio with its logical sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub seq: u64,
    pub sample_rate: u32,
    pub data: Bytes,
}

impl AudioChunk {
    /// Base64-encode for the wire.
    pub fn encode(&self) -> EncodedFrame {
        EncodedFrame {
            seq: self.seq,
            sample_rate: self.sample_rate,
            data: pcm::encode_frame(&self.data),
        }
    }
}

/// A base64-encoded PCM16 frame ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    pub seq: u64,
    pub sample_rate: u32,
    pub data: String,
}

// =============================================================================
// Tool Calls
// =============================================================================

/// A function the service asks the client to invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// The client's answer to one [`FunctionCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

impl FunctionResponse {
    pub fn result(call: &FunctionCall, result: Value) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            response: serde_json::json!({ "result": result }),
        }
    }

    pub fn error(call: &FunctionCall, message: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            response: serde_json::json!({ "error": message.into() }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.response.get("error").is_some()
    }
}

/// Client-side activity signals for realtime input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityMarker {
    ActivityStart,
    ActivityEnd,
    /// The microphone stream paused; the service should flush cached audio.
    AudioStreamEnd,
}

// =============================================================================
// Events
// =============================================================================

/// Which side of the conversation a transcription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionSource {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDirection {
    Client,
    Server,
    Local,
}

impl fmt::Display for LogDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Structured session log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: SystemTime,
    pub direction: LogDirection,
    pub kind: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(direction: LogDirection, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            direction,
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Events emitted by a live session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Open,
    SetupComplete,
    /// Parts of the turn in progress, in arrival order.
    Content(Vec<ContentPart>),
    /// Decoded PCM16 model audio.
    Audio(Bytes),
    ToolCall(Vec<FunctionCall>),
    ToolCallCancellation(Vec<String>),
    Interrupted,
    TurnComplete(Turn),
    Transcription {
        source: TranscriptionSource,
        text: String,
    },
    Usage(Value),
    GoAway {
        time_left: Option<String>,
    },
    ResumptionUpdate {
        handle: Option<String>,
        resumable: bool,
    },
    Log(LogEntry),
    Error(String),
    Close(String),
}

impl SessionEvent {
    /// Events that carry model output. Never delivered after teardown.
    pub fn is_output(&self) -> bool {
        matches!(self, Self::Audio(_) | Self::Content(_))
    }
}

/// Output gate shared between a session and its connection task.
///
/// Closing the gate and emitting model output are serialized, so nothing
/// emitted under the gate can land after [`OutputGate::close`] returns.
#[derive(Debug, Default)]
pub(crate) struct OutputGate {
    closed: AtomicBool,
    lock: Mutex<()>,
}

impl OutputGate {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `f` only while the gate is open.
    pub(crate) fn while_open(&self, f: impl FnOnce()) -> bool {
        let _guard = self.lock.lock();
        if self.is_closed() {
            return false;
        }
        f();
        true
    }

    /// Close the gate, running `f` after no further output can pass.
    pub(crate) fn close(&self, f: impl FnOnce()) {
        let _guard = self.lock.lock();
        self.closed.store(true, Ordering::Release);
        f();
    }
}

/// Sending half of a session event channel.
#[derive(Debug, Clone)]
pub(crate) struct EventEmitter {
    tx: mpsc::UnboundedSender<SessionEvent>,
    gate: Arc<OutputGate>,
    close_emitted: Arc<AtomicBool>,
}

impl EventEmitter {
    pub(crate) fn channel() -> (Self, SessionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(OutputGate::default());
        (
            Self {
                tx,
                gate: gate.clone(),
                close_emitted: Arc::new(AtomicBool::new(false)),
            },
            SessionEvents { rx, gate },
        )
    }

    pub(crate) fn gate(&self) -> &Arc<OutputGate> {
        &self.gate
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if event.is_output() {
            self.gate.while_open(|| {
                let _ = self.tx.send(event);
            });
        } else {
            let _ = self.tx.send(event);
        }
    }

    /// Send without consulting the gate. For use inside [`OutputGate::while_open`].
    pub(crate) fn emit_ungated(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn log(
        &self,
        direction: LogDirection,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.emit(SessionEvent::Log(LogEntry::new(direction, kind, message)));
    }

    /// Surface an error as one log entry plus one error event.
    pub(crate) fn error(&self, kind: &str, message: impl Into<String>) {
        let message = message.into();
        self.log(LogDirection::Local, kind, message.clone());
        self.emit(SessionEvent::Error(message));
    }

    /// Emit `Close` at most once per connection.
    pub(crate) fn close(&self, reason: impl Into<String>) {
        if !self.close_emitted.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(SessionEvent::Close(reason.into()));
        }
    }
}

/// Receiving half of a session's event channel.
///
/// One receiver per `connect()`; a fresh connection hands out a fresh one.
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    gate: Arc<OutputGate>,
}

impl SessionEvents {
    /// Wait for the next event. Returns `None` once the session is gone and
    /// every queued event has been delivered.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            let event = self.rx.recv().await?;
            if event.is_output() && self.gate.is_closed() {
                continue;
            }
            return Some(event);
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            let event = self.rx.try_recv().ok()?;
            if event.is_output() && self.gate.is_closed() {
                continue;
            }
            return Some(event);
        }
    }
}
