//! Live session client.
//!
//! [`LiveSession`] owns one WebSocket connection to the bidirectional
//! streaming endpoint and runs its protocol state machine:
//!
//! ```text
//! Idle ─► Connecting ─► AwaitingSetupAck ─► Active ─► Closing ─► Closed
//!            │                 │              │
//!            └─────────────────┴──────────────┴──► Error
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use waav_live::core::session::{LiveSession, SessionConfig, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut session = LiveSession::new(SessionConfig::new("api-key"))?;
//!     let mut events = session.connect().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::SetupComplete => session.send_text("Hello!", true)?,
//!             SessionEvent::TurnComplete(turn) => println!("{}", turn.text()),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Threading
//!
//! The connection task owns the socket and the turn accumulator; nothing
//! else touches them. The session talks to it through an outgoing queue and
//! shares only the state enum, the outstanding tool-call ledger and the last
//! resumption handle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::base::{
    ActivityMarker, AudioChunk, Content, ContentPart, EncodedFrame, EventEmitter,
    FunctionResponse, LiveError, LiveResult, LogDirection, SessionEvent, SessionEvents,
    SessionState, TranscriptionSource,
};
use super::config::SessionConfig;
use super::messages::{
    IncomingMessage, OutgoingMessage, RealtimeInput, ServerContent, Setup, ToolResponse,
    parse_incoming,
};
use crate::core::playback::PlaybackHandle;
use crate::core::turn::TurnAccumulator;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long a cancelled connection waits to deliver its close frame.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_millis(500);

// =============================================================================
// Tool-call ledger
// =============================================================================

/// Outstanding `toolCall` batches, by id set.
#[derive(Debug, Default)]
struct PendingToolCalls {
    batches: Vec<HashSet<String>>,
}

impl PendingToolCalls {
    fn insert(&mut self, ids: HashSet<String>) {
        if !ids.is_empty() {
            self.batches.push(ids);
        }
    }

    /// Remove cancelled ids; batches left empty are dropped.
    fn cancel(&mut self, ids: &[String]) {
        for batch in &mut self.batches {
            for id in ids {
                batch.remove(id);
            }
        }
        self.batches.retain(|b| !b.is_empty());
    }

    /// Remove and report the batch whose ids equal `ids` exactly.
    fn take_matching(&mut self, ids: &HashSet<String>) -> bool {
        match self.batches.iter().position(|b| b == ids) {
            Some(index) => {
                self.batches.remove(index);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.batches.len()
    }

    fn clear(&mut self) {
        self.batches.clear();
    }
}

// =============================================================================
// Live Session
// =============================================================================

struct Outbound {
    kind: &'static str,
    json: String,
}

/// Handles for one live connection.
struct Connection {
    outgoing: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Client for one bidirectional streaming session at a time.
pub struct LiveSession {
    config: SessionConfig,
    state: Arc<RwLock<SessionState>>,
    pending_calls: Arc<Mutex<PendingToolCalls>>,
    resumption_handle: Arc<RwLock<Option<String>>>,
    playback: Option<PlaybackHandle>,
    /// Emitter of the current (or last) connection
    emitter: Option<EventEmitter>,
    connection: Option<Connection>,
}

impl LiveSession {
    pub fn new(config: SessionConfig) -> LiveResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Arc::new(RwLock::new(SessionState::Idle)),
            pending_calls: Arc::new(Mutex::new(PendingToolCalls::default())),
            resumption_handle: Arc::new(RwLock::new(None)),
            playback: None,
            emitter: None,
            connection: None,
        })
    }

    /// Route model audio to a playback driver. Takes effect on the next
    /// `connect()`.
    pub fn attach_playback(&mut self, playback: PlaybackHandle) {
        self.playback = Some(playback);
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Resume the session identified by `handle` on the next `connect()`.
    pub fn resume_with(&mut self, handle: impl Into<String>) {
        self.config.resumption_handle = Some(handle.into());
        self.config.session_resumption = true;
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Most recent resumable handle announced by the service.
    pub fn session_resumption_handle(&self) -> Option<String> {
        self.resumption_handle.read().clone()
    }

    /// Number of tool-call batches awaiting a response.
    pub fn pending_tool_calls(&self) -> usize {
        self.pending_calls.lock().len()
    }

    /// Open the socket and send `setup`.
    ///
    /// Resolves once the socket is open; the session becomes `Active` when
    /// `setupComplete` arrives (signalled by [`SessionEvent::SetupComplete`]).
    /// Every call builds a fresh connection with a fresh event channel.
    pub async fn connect(&mut self) -> LiveResult<SessionEvents> {
        if self.state().is_live() {
            return Err(LiveError::InvalidConfiguration(
                "already connected".to_string(),
            ));
        }
        self.release_connection();

        let url = self.config.build_url()?;
        let setup = OutgoingMessage::Setup(Setup::from(&self.config)).to_json()?;
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);

        *self.state.write() = SessionState::Connecting;
        self.pending_calls.lock().clear();
        info!(
            "Connecting to live endpoint {} (model {})",
            url.host_str().unwrap_or_default(),
            self.config.model
        );

        let ws = match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
        {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                *self.state.write() = SessionState::Error;
                error!("Live connection failed: {}", e);
                return Err(LiveError::ConnectionFailed(e.to_string()));
            }
            Err(_) => {
                *self.state.write() = SessionState::Error;
                error!("Live connection timed out after {:?}", timeout);
                return Err(LiveError::ConnectionFailed(format!(
                    "timed out after {}ms",
                    self.config.connect_timeout_ms
                )));
            }
        };

        let (mut ws_sink, ws_source) = ws.split();
        let (emitter, events) = EventEmitter::channel();
        emitter.emit(SessionEvent::Open);
        emitter.log(LogDirection::Local, "open", "socket open");

        // Setup goes out before anything else can be queued.
        if let Err(e) = ws_sink.send(Message::Text(setup.into())).await {
            *self.state.write() = SessionState::Error;
            let reason = format!("failed to send setup: {}", e);
            error!("{}", reason);
            emitter.error("transport_error", reason.clone());
            emitter.close(reason.clone());
            self.emitter = Some(emitter);
            return Err(LiveError::Transport(reason));
        }
        emitter.log(LogDirection::Client, "setup", self.config.model.clone());
        *self.state.write() = SessionState::AwaitingSetupAck;
        debug!("Setup sent, awaiting setupComplete");

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = ConnectionTask {
            state: self.state.clone(),
            emitter: emitter.clone(),
            accumulator: TurnAccumulator::new(),
            playback: self.playback.clone(),
            pending_calls: self.pending_calls.clone(),
            resumption_handle: self.resumption_handle.clone(),
            residual_audio: 0,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run(ws_sink, ws_source, rx));

        self.emitter = Some(emitter);
        self.connection = Some(Connection {
            outgoing: tx,
            cancel,
            handle,
        });
        Ok(events)
    }

    /// Tear the connection down immediately.
    ///
    /// Stops attached playback and emits `Close` (once). After this returns
    /// no further `Audio` or `Content` events are delivered.
    pub fn disconnect(&mut self) {
        let previous = std::mem::replace(&mut *self.state.write(), SessionState::Closed);

        let playback = self.playback.clone();
        let stop_playback = || {
            if let Some(playback) = &playback
                && let Err(e) = playback.stop()
            {
                debug!("Playback already closed: {}", e);
            }
        };
        match &self.emitter {
            Some(emitter) => emitter.gate().close(stop_playback),
            None => stop_playback(),
        }

        self.release_connection();
        self.pending_calls.lock().clear();

        if let Some(emitter) = &self.emitter {
            if previous.is_live() {
                emitter.log(LogDirection::Local, "close", "client disconnect");
            }
            emitter.close("client disconnect");
        }
        info!("Disconnected from live endpoint (was {})", previous);
    }

    fn release_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.cancel.cancel();
            // The task delivers a close frame and exits on its own.
            drop(connection.handle);
        }
    }

    // =========================================================================
    // Send path
    // =========================================================================

    fn reject(&self, kind: &str, state: SessionState) -> LiveError {
        let message = format!("cannot send {} while session is {}", kind, state);
        warn!("{}", message);
        if let Some(emitter) = &self.emitter {
            emitter.error("send_rejected", message);
        }
        LiveError::SendRejected { state }
    }

    fn active_connection(&self) -> Result<&Connection, SessionState> {
        let state = self.state();
        match &self.connection {
            Some(connection) if state == SessionState::Active => Ok(connection),
            _ => Err(state),
        }
    }

    fn enqueue(&self, connection: &Connection, message: &OutgoingMessage) -> LiveResult<()> {
        let json = message.to_json().inspect_err(|e| {
            if let Some(emitter) = &self.emitter {
                emitter.error("serialization_error", e.to_string());
            }
        })?;
        connection
            .outgoing
            .send(Outbound {
                kind: message.kind(),
                json,
            })
            .map_err(|_| LiveError::NotConnected)
    }

    /// Serialize and queue `message`, or reject it when not `Active`.
    ///
    /// A rejection also emits exactly one `Error` event. Before the first
    /// `connect()` there is no event channel yet, so the returned
    /// [`LiveError::SendRejected`] is the only report.
    pub fn send_message(&self, message: OutgoingMessage) -> LiveResult<()> {
        if let OutgoingMessage::Setup(_) = message {
            return Err(LiveError::Protocol(
                "setup is sent by connect() only".to_string(),
            ));
        }
        let connection = self
            .active_connection()
            .map_err(|state| self.reject(message.kind(), state))?;
        self.enqueue(connection, &message)
    }

    /// Send complete client turns. Rejected unless `Active`; see
    /// [`send_message`](Self::send_message).
    pub fn send(&self, turns: Vec<Content>, turn_complete: bool) -> LiveResult<()> {
        let message = OutgoingMessage::client_content(&turns, turn_complete);
        self.send_message(message)?;
        if let Some(emitter) = &self.emitter {
            let text: String = turns
                .iter()
                .flat_map(|t| t.parts.iter().filter_map(ContentPart::as_text))
                .collect::<Vec<_>>()
                .join(" ");
            emitter.log(LogDirection::Client, "clientContent", text);
        }
        Ok(())
    }

    pub fn send_text(&self, text: impl Into<String>, turn_complete: bool) -> LiveResult<()> {
        self.send(vec![Content::user_text(text)], turn_complete)
    }

    /// Stream one microphone chunk.
    ///
    /// Fire-and-forget: while the session is not `Active` the chunk is
    /// dropped and logged, never buffered.
    pub fn send_realtime_audio(&self, chunk: &AudioChunk) -> LiveResult<()> {
        self.send_realtime_frame(&chunk.encode())
    }

    /// Stream one already-encoded microphone frame. See
    /// [`send_realtime_audio`](Self::send_realtime_audio).
    pub fn send_realtime_frame(&self, frame: &EncodedFrame) -> LiveResult<()> {
        let connection = match self.active_connection() {
            Ok(connection) => connection,
            Err(state) => {
                trace!("Dropping audio frame {} while {}", frame.seq, state);
                if let Some(emitter) = &self.emitter {
                    emitter.log(
                        LogDirection::Local,
                        "audio_dropped",
                        format!("frame {} dropped while {}", frame.seq, state),
                    );
                }
                return Err(LiveError::SendRejected { state });
            }
        };
        self.enqueue(
            connection,
            &OutgoingMessage::RealtimeInput(RealtimeInput::audio(frame)),
        )
    }

    pub fn send_realtime_text(&self, text: impl Into<String>) -> LiveResult<()> {
        self.send_message(OutgoingMessage::RealtimeInput(RealtimeInput::text(text)))
    }

    pub fn send_activity(&self, marker: ActivityMarker) -> LiveResult<()> {
        self.send_message(OutgoingMessage::RealtimeInput(RealtimeInput::activity(
            marker,
        )))?;
        if let Some(emitter) = &self.emitter {
            emitter.log(LogDirection::Client, "realtimeInput", format!("{:?}", marker));
        }
        Ok(())
    }

    /// Answer one `toolCall` batch with all of its responses.
    ///
    /// The response ids must equal the ids of exactly one outstanding batch,
    /// in any order.
    pub fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> LiveResult<()> {
        let connection = self
            .active_connection()
            .map_err(|state| self.reject("toolResponse", state))?;

        let ids: HashSet<String> = responses.iter().map(|r| r.id.clone()).collect();
        let matched = ids.len() == responses.len() && self.pending_calls.lock().take_matching(&ids);
        if !matched {
            let mut sorted: Vec<_> = ids.into_iter().collect();
            sorted.sort();
            let message = format!(
                "ids [{}] do not answer exactly one outstanding tool call",
                sorted.join(", ")
            );
            warn!("Tool response rejected: {}", message);
            if let Some(emitter) = &self.emitter {
                emitter.error("tool_response_mismatch", message.clone());
            }
            return Err(LiveError::ToolResponseMismatch(message));
        }

        let names: Vec<&str> = responses.iter().map(|r| r.name.as_str()).collect();
        let summary = names.join(", ");
        self.enqueue(
            connection,
            &OutgoingMessage::ToolResponse(ToolResponse {
                function_responses: responses,
            }),
        )?;
        if let Some(emitter) = &self.emitter {
            emitter.log(LogDirection::Client, "toolResponse", summary);
        }
        Ok(())
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.release_connection();
    }
}

// =============================================================================
// Connection task
// =============================================================================

struct ConnectionTask {
    state: Arc<RwLock<SessionState>>,
    emitter: EventEmitter,
    accumulator: TurnAccumulator,
    playback: Option<PlaybackHandle>,
    pending_calls: Arc<Mutex<PendingToolCalls>>,
    resumption_handle: Arc<RwLock<Option<String>>>,
    /// Model audio bytes not yet covered by a log entry
    residual_audio: usize,
    cancel: CancellationToken,
}

impl ConnectionTask {
    async fn run(
        mut self,
        mut sink: WsSink,
        mut source: WsSource,
        mut outgoing: mpsc::UnboundedReceiver<Outbound>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("Live connection cancelled, sending close frame");
                    let _ = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, sink.send(Message::Close(None))).await;
                    break;
                }

                Some(out) = outgoing.recv() => {
                    let state = *self.state.read();
                    if state != SessionState::Active {
                        warn!("Dropping queued {} while {}", out.kind, state);
                        self.emitter.log(
                            LogDirection::Local,
                            "send_dropped",
                            format!("{} dropped while {}", out.kind, state),
                        );
                        continue;
                    }
                    trace!("Sending {} ({} bytes)", out.kind, out.json.len());
                    if let Err(e) = sink.send(Message::Text(out.json.into())).await {
                        self.transport_failed(format!("send failed: {}", e));
                        break;
                    }
                }

                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.handle_frame(text),
                        Err(_) => self.protocol_error("binary frame is not UTF-8 JSON".to_string()),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            self.transport_failed(format!("failed to send pong: {}", e));
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                            .unwrap_or_else(|| "closed by server".to_string());
                        self.server_closed(reason);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.transport_failed(e.to_string());
                        break;
                    }
                    None => {
                        self.server_closed("connection ended".to_string());
                        break;
                    }
                },
            }
        }

        self.accumulator.reset();
        debug!("Live connection task ended");
    }

    fn protocol_error(&self, message: String) {
        warn!("Protocol error: {}", message);
        self.emitter.error("protocol_error", message);
    }

    fn transport_failed(&self, reason: String) {
        {
            let mut state = self.state.write();
            if state.is_terminal() {
                return;
            }
            *state = SessionState::Error;
        }
        error!("Live transport error: {}", reason);
        self.emitter.error("transport_error", reason.clone());
        self.emitter.close(reason);
    }

    fn server_closed(&self, reason: String) {
        {
            let mut state = self.state.write();
            if state.is_terminal() {
                return;
            }
            *state = SessionState::Closing;
        }
        info!("Live connection closed by server: {}", reason);
        *self.state.write() = SessionState::Closed;
        self.emitter
            .log(LogDirection::Server, "close", reason.clone());
        self.emitter.close(reason);
    }

    fn handle_frame(&mut self, text: &str) {
        let frame = match parse_incoming(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.protocol_error(e.to_string());
                return;
            }
        };

        let state = *self.state.read();
        let kind = frame.message.kind();
        let is_setup = matches!(frame.message, IncomingMessage::SetupComplete);
        match (is_setup, state) {
            (true, SessionState::AwaitingSetupAck) => {
                {
                    let mut state = self.state.write();
                    if *state != SessionState::AwaitingSetupAck {
                        return;
                    }
                    *state = SessionState::Active;
                }
                info!("Live session active");
                self.emitter
                    .log(LogDirection::Server, "setupComplete", "");
                self.emitter.emit(SessionEvent::SetupComplete);
            }
            (true, state) => {
                self.protocol_error(format!("unexpected setupComplete while {}", state));
                return;
            }
            (false, SessionState::AwaitingSetupAck) => {
                self.protocol_error(format!("{} before setupComplete", kind));
                return;
            }
            (false, SessionState::Active) => self.dispatch(frame.message),
            (false, state) => {
                debug!("Ignoring {} while {}", kind, state);
                return;
            }
        }

        if let Some(usage) = frame.usage {
            self.emitter.emit(SessionEvent::Usage(usage));
        }
    }

    fn dispatch(&mut self, message: IncomingMessage) {
        match message {
            IncomingMessage::ServerContent(content) => self.handle_server_content(content),
            IncomingMessage::ToolCall(calls) => {
                let ids: HashSet<String> = calls.iter().map(|c| c.id.clone()).collect();
                self.pending_calls.lock().insert(ids);
                let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
                info!("Tool call: {}", names.join(", "));
                self.emitter
                    .log(LogDirection::Server, "toolCall", names.join(", "));
                self.emitter.emit(SessionEvent::ToolCall(calls));
            }
            IncomingMessage::ToolCallCancellation(ids) => {
                self.pending_calls.lock().cancel(&ids);
                debug!("Tool calls cancelled: {:?}", ids);
                self.emitter
                    .log(LogDirection::Server, "toolCallCancellation", ids.join(", "));
                self.emitter.emit(SessionEvent::ToolCallCancellation(ids));
            }
            IncomingMessage::UsageMetadata(usage) => {
                self.emitter.emit(SessionEvent::Usage(usage));
            }
            IncomingMessage::GoAway { time_left } => {
                warn!("Server going away (time left: {:?})", time_left);
                self.emitter.log(
                    LogDirection::Server,
                    "goAway",
                    time_left.clone().unwrap_or_default(),
                );
                self.emitter.emit(SessionEvent::GoAway { time_left });
            }
            IncomingMessage::SessionResumptionUpdate {
                new_handle,
                resumable,
            } => {
                if resumable && let Some(handle) = &new_handle {
                    *self.resumption_handle.write() = Some(handle.clone());
                }
                debug!("Session resumption update (resumable: {})", resumable);
                self.emitter.emit(SessionEvent::ResumptionUpdate {
                    handle: new_handle,
                    resumable,
                });
            }
            IncomingMessage::SetupComplete => {
                self.protocol_error("duplicate setupComplete".to_string());
            }
        }
    }

    fn handle_server_content(&mut self, content: ServerContent) {
        if content.interrupted {
            debug!("Model turn interrupted");
            self.accumulator.reset();
            self.residual_audio = 0;
            if let Some(playback) = &self.playback
                && let Err(e) = playback.stop()
            {
                debug!("Playback not stopped: {}", e);
            }
            self.emitter.log(LogDirection::Server, "interrupted", "");
            self.emitter.emit(SessionEvent::Interrupted);
        }

        if let Some(text) = content.input_transcription {
            self.emitter.emit(SessionEvent::Transcription {
                source: TranscriptionSource::Input,
                text,
            });
        }
        if let Some(text) = content.output_transcription {
            self.emitter.emit(SessionEvent::Transcription {
                source: TranscriptionSource::Output,
                text,
            });
        }

        if !content.parts.is_empty() {
            self.forward_parts(content.parts);
        }

        if content.generation_complete {
            debug!("Generation complete");
            self.emitter
                .log(LogDirection::Server, "generationComplete", "");
        }

        if content.turn_complete {
            let turn = self.accumulator.seal();
            debug!("Turn complete ({} parts)", turn.len());
            self.emitter.log(
                LogDirection::Server,
                "turnComplete",
                format!("{} parts", turn.len()),
            );
            self.emitter.emit(SessionEvent::TurnComplete(turn));
            if let Some(playback) = &self.playback
                && let Err(e) = playback.complete()
            {
                debug!("Playback not completed: {}", e);
            }
            // Audio that trailed the last text fragment.
            self.flush_residual_audio();
        }
    }

    fn forward_parts(&mut self, parts: Vec<ContentPart>) {
        self.accumulator.add_parts(parts.iter().cloned());

        let audio: Vec<Bytes> = parts
            .iter()
            .filter(|p| p.is_pcm_audio())
            .filter_map(|p| match p {
                ContentPart::InlineAudio { data, .. } => Some(data.clone()),
                ContentPart::Text(_) => None,
            })
            .collect();
        let text: Vec<&str> = parts.iter().filter_map(ContentPart::as_text).collect();

        if !text.is_empty() {
            self.flush_residual_audio();
            self.emitter
                .log(LogDirection::Server, "serverContent", text.join(""));
        }
        self.residual_audio += audio.iter().map(Bytes::len).sum::<usize>();

        let emitter = &self.emitter;
        let playback = &self.playback;
        emitter.gate().while_open(|| {
            emitter.emit_ungated(SessionEvent::Content(parts));
            for chunk in audio {
                if let Some(playback) = playback
                    && let Err(e) = playback.push(chunk.clone())
                {
                    debug!("Model audio not queued for playback: {}", e);
                }
                emitter.emit_ungated(SessionEvent::Audio(chunk));
            }
        });
    }

    fn flush_residual_audio(&mut self) {
        if self.residual_audio > 0 {
            self.emitter.log(
                LogDirection::Server,
                "audio",
                format!("buffer ({} bytes)", self.residual_audio),
            );
            self.residual_audio = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::new("test-key")
    }

    #[test]
    fn test_new_validates_config() {
        assert!(LiveSession::new(SessionConfig::default()).is_err());
        let session = LiveSession::new(config()).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_active());
    }

    #[test]
    fn test_send_before_connect_is_rejected() {
        let session = LiveSession::new(config()).unwrap();
        let result = session.send_text("hi", true);
        assert!(matches!(
            result,
            Err(LiveError::SendRejected {
                state: SessionState::Idle
            })
        ));
    }

    #[test]
    fn test_setup_cannot_be_sent_manually() {
        let session = LiveSession::new(config()).unwrap();
        let result = session.send_message(OutgoingMessage::Setup(Setup::from(&config())));
        assert!(matches!(result, Err(LiveError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_connect_failure_sets_error_state() {
        let mut cfg = config();
        // Nothing listens on port 9 of localhost in test environments.
        cfg.endpoint = "ws://127.0.0.1:9/".to_string();
        cfg.connect_timeout_ms = 2000;
        let mut session = LiveSession::new(cfg).unwrap();

        let result = session.connect().await;
        assert!(matches!(result, Err(LiveError::ConnectionFailed(_))));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn test_pending_tool_calls_ledger() {
        let mut ledger = PendingToolCalls::default();
        ledger.insert(["a".to_string(), "b".to_string()].into_iter().collect());
        ledger.insert(["c".to_string()].into_iter().collect());

        let wrong: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert!(!ledger.take_matching(&wrong));

        let right: HashSet<String> = ["b".to_string(), "a".to_string()].into_iter().collect();
        assert!(ledger.take_matching(&right));
        assert_eq!(ledger.len(), 1);

        ledger.cancel(&["c".to_string()]);
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn test_disconnect_without_connection() {
        let mut session = LiveSession::new(config()).unwrap();
        session.disconnect();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
