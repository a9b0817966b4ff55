//! Application-side wiring of a live session.
//!
//! A [`Conversation`] owns the [`LiveSession`] together with the optional
//! microphone pipeline, the optional playback driver and the tool registry:
//!
//! - capture frames go to `send_realtime_frame` while the session is active
//! - `SilenceDetected` ends the audio stream (`audioStreamEnd`)
//! - `ToolCall` batches run on the [`ToolDispatcher`] and are answered with
//!   a single `send_tool_response`
//! - `TurnComplete` is reported once the turn is sealed and, if it carried
//!   audio, playback has drained

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::capture::{AudioCapture, CaptureError, CaptureEvent, CaptureEvents};
use crate::core::playback::{PlaybackEvent, PlaybackEvents, PlaybackHandle};
use crate::core::session::{
    ActivityMarker, FunctionResponse, LiveError, LiveSession, SessionEvent, SessionEvents,
};
use crate::core::tools::ToolDispatcher;
use crate::core::turn::Turn;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error(transparent)]
    Session(#[from] LiveError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

pub type ConversationResult<T> = Result<T, ConversationError>;

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// Any session event other than `TurnComplete`
    Session(SessionEvent),
    /// A sealed turn whose audio (if any) has finished playing
    TurnComplete(Turn),
    VoiceStart { at_ms: u64 },
    SilenceDetected { at_ms: u64 },
    /// Microphone level, 0.0..=1.0
    Volume(f32),
    PlaybackStarted,
    /// A tool-call batch was answered
    ToolResponded { ids: Vec<String> },
}

pub struct Conversation {
    session: LiveSession,
    session_events: Option<SessionEvents>,
    capture: Option<(AudioCapture, CaptureEvents)>,
    playback: Option<(PlaybackHandle, PlaybackEvents)>,
    tools: Arc<ToolDispatcher>,
    tool_tx: mpsc::UnboundedSender<Vec<FunctionResponse>>,
    tool_rx: mpsc::UnboundedReceiver<Vec<FunctionResponse>>,
    cancelled_calls: HashSet<String>,
    /// Sealed turn waiting for its audio to finish playing, with the
    /// playback stream that audio went to
    pending_turn: Option<(Turn, u64)>,
    /// Event held back while a pending turn is reported first
    deferred: Option<ConversationEvent>,
}

impl Conversation {
    pub fn new(session: LiveSession) -> Self {
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        Self {
            session,
            session_events: None,
            capture: None,
            playback: None,
            tools: Arc::new(ToolDispatcher::new()),
            tool_tx,
            tool_rx,
            cancelled_calls: HashSet::new(),
            pending_turn: None,
            deferred: None,
        }
    }

    pub fn with_capture(mut self, capture: AudioCapture, events: CaptureEvents) -> Self {
        self.capture = Some((capture, events));
        self
    }

    pub fn with_playback(mut self, handle: PlaybackHandle, events: PlaybackEvents) -> Self {
        self.session.attach_playback(handle.clone());
        self.playback = Some((handle, events));
        self
    }

    pub fn with_tools(mut self, tools: ToolDispatcher) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn session(&self) -> &LiveSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut LiveSession {
        &mut self.session
    }

    /// Connect the session, then start the microphone if one is attached.
    ///
    /// Frames captured before `setupComplete` are dropped.
    pub async fn connect(&mut self) -> ConversationResult<()> {
        self.pending_turn = None;
        self.deferred = None;
        self.cancelled_calls.clear();
        self.session_events = Some(self.session.connect().await?);

        if let Some((capture, _)) = &self.capture
            && let Err(e) = capture.start().await
        {
            warn!("Microphone unavailable: {}", e);
            self.session.disconnect();
            return Err(e.into());
        }
        Ok(())
    }

    /// Stop the microphone and tear the session down.
    ///
    /// Returns the PCM16 captured since the microphone started.
    pub async fn disconnect(&mut self) -> bytes::Bytes {
        let replay = match &self.capture {
            Some((capture, _)) => capture.stop().await,
            None => bytes::Bytes::new(),
        };
        self.session.disconnect();
        self.pending_turn = None;
        self.deferred = None;
        replay
    }

    /// Wait for the next application event, routing internal traffic on the
    /// way. Returns `None` once the session's event channel has ended.
    ///
    /// Cancel safe: dropping the future loses no events.
    pub async fn next_event(&mut self) -> Option<ConversationEvent> {
        if let Some(event) = self.deferred.take() {
            return Some(event);
        }
        loop {
            let session_events = self.session_events.as_mut()?;
            let capture_events = self.capture.as_mut().map(|(_, events)| events);
            let playback_events = self.playback.as_mut().map(|(_, events)| events);

            // Session first: a turn's TurnComplete is always queued before
            // the playback completion it waits for.
            let routed = tokio::select! {
                biased;
                event = session_events.recv() => match event {
                    Some(event) => Routed::Session(event),
                    None => Routed::SessionEnded,
                },
                Some(responses) = self.tool_rx.recv() => Routed::ToolResponses(responses),
                Some(event) = async {
                    match playback_events {
                        Some(events) => events.recv().await,
                        None => std::future::pending().await,
                    }
                } => Routed::Playback(event),
                Some(event) = async {
                    match capture_events {
                        Some(events) => events.recv().await,
                        None => std::future::pending().await,
                    }
                } => Routed::Capture(event),
            };

            let emitted = match routed {
                Routed::Session(event) => self.on_session_event(event),
                Routed::SessionEnded => {
                    self.session_events = None;
                    return self.release_pending();
                }
                Routed::ToolResponses(responses) => self.on_tool_responses(responses),
                Routed::Playback(event) => self.on_playback_event(event),
                Routed::Capture(event) => self.on_capture_event(event),
            };
            if emitted.is_some() {
                return emitted;
            }
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) -> Option<ConversationEvent> {
        match event {
            SessionEvent::TurnComplete(turn) => match &self.playback {
                Some((handle, _)) if turn.has_audio() => {
                    let stream = handle.stream_id();
                    debug!("Turn sealed, waiting for playback stream {} to drain", stream);
                    // An earlier turn still waiting shares the stream and
                    // finished ahead of this one.
                    self.pending_turn
                        .replace((turn, stream))
                        .map(|(earlier, _)| ConversationEvent::TurnComplete(earlier))
                }
                _ => Some(ConversationEvent::TurnComplete(turn)),
            },
            SessionEvent::Interrupted => {
                // The interruption cut whatever the pending turn had left.
                let event = ConversationEvent::Session(SessionEvent::Interrupted);
                match self.release_pending() {
                    Some(turn) => {
                        self.deferred = Some(event);
                        Some(turn)
                    }
                    None => Some(event),
                }
            }
            SessionEvent::ToolCall(calls) => {
                let tools = self.tools.clone();
                let tx = self.tool_tx.clone();
                let batch = calls.clone();
                tokio::spawn(async move {
                    let _ = tx.send(tools.dispatch(batch).await);
                });
                Some(ConversationEvent::Session(SessionEvent::ToolCall(calls)))
            }
            SessionEvent::ToolCallCancellation(ids) => {
                self.cancelled_calls.extend(ids.iter().cloned());
                Some(ConversationEvent::Session(SessionEvent::ToolCallCancellation(
                    ids,
                )))
            }
            other => Some(ConversationEvent::Session(other)),
        }
    }

    fn on_tool_responses(
        &mut self,
        mut responses: Vec<FunctionResponse>,
    ) -> Option<ConversationEvent> {
        responses.retain(|r| !self.cancelled_calls.remove(&r.id));
        if responses.is_empty() {
            debug!("Tool batch fully cancelled, nothing to send");
            return None;
        }
        let ids: Vec<String> = responses.iter().map(|r| r.id.clone()).collect();
        match self.session.send_tool_response(responses) {
            Ok(()) => Some(ConversationEvent::ToolResponded { ids }),
            Err(e) => {
                warn!("Tool response not sent: {}", e);
                None
            }
        }
    }

    fn on_playback_event(&mut self, event: PlaybackEvent) -> Option<ConversationEvent> {
        match event {
            PlaybackEvent::Started { .. } => Some(ConversationEvent::PlaybackStarted),
            PlaybackEvent::Complete { stream } | PlaybackEvent::Stopped { stream } => {
                match self.pending_turn.as_ref().map(|(_, pending)| *pending) {
                    Some(pending) if stream >= pending => self.release_pending(),
                    Some(pending) => {
                        debug!(
                            "Ignoring end of playback stream {} while waiting on {}",
                            stream, pending
                        );
                        None
                    }
                    None => None,
                }
            }
        }
    }

    fn release_pending(&mut self) -> Option<ConversationEvent> {
        self.pending_turn
            .take()
            .map(|(turn, _)| ConversationEvent::TurnComplete(turn))
    }

    fn on_capture_event(&mut self, event: CaptureEvent) -> Option<ConversationEvent> {
        match event {
            CaptureEvent::FrameReady(frame) => {
                if self.session.is_active() {
                    let _ = self.session.send_realtime_frame(&frame);
                } else {
                    tracing::trace!("Dropping frame {} while not active", frame.seq);
                }
                None
            }
            CaptureEvent::Volume(level) => Some(ConversationEvent::Volume(level)),
            CaptureEvent::VoiceStart { at_ms } => Some(ConversationEvent::VoiceStart { at_ms }),
            CaptureEvent::SilenceDetected { at_ms } => {
                if self.session.is_active() {
                    info!("Silence after speech, ending audio stream");
                    if let Err(e) = self.session.send_activity(ActivityMarker::AudioStreamEnd) {
                        warn!("Failed to end audio stream: {}", e);
                    }
                }
                Some(ConversationEvent::SilenceDetected { at_ms })
            }
        }
    }
}

enum Routed {
    Session(SessionEvent),
    SessionEnded,
    ToolResponses(Vec<FunctionResponse>),
    Playback(PlaybackEvent),
    Capture(CaptureEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::{FunctionCall, SessionConfig};

    fn conversation() -> Conversation {
        Conversation::new(LiveSession::new(SessionConfig::new("test-key")).unwrap())
    }

    #[tokio::test]
    async fn test_next_event_without_connection_is_none() {
        let mut conversation = conversation();
        assert!(conversation.next_event().await.is_none());
    }

    #[test]
    fn test_text_turn_completes_immediately() {
        let mut conversation = conversation();
        let mut accumulator = crate::core::turn::TurnAccumulator::new();
        accumulator.add_parts([crate::core::session::ContentPart::text("hi")]);
        let event = conversation.on_session_event(SessionEvent::TurnComplete(accumulator.seal()));
        assert!(matches!(event, Some(ConversationEvent::TurnComplete(t)) if t.text() == "hi"));
    }

    fn audio_turn() -> Turn {
        let mut accumulator = crate::core::turn::TurnAccumulator::new();
        accumulator.add_parts([crate::core::session::ContentPart::pcm16(24000, vec![0u8; 480])]);
        accumulator.seal()
    }

    #[tokio::test]
    async fn test_stale_stop_does_not_release_next_turn() {
        let (handle, events) = crate::core::playback::PlaybackHandle::spawn(
            crate::core::playback::VirtualSink::manual(24000),
            crate::core::playback::PlaybackConfig::default(),
        )
        .unwrap();
        let mut conversation = conversation().with_playback(handle.clone(), events);

        // Interruption of stream 0; the next turn's audio joins stream 1.
        handle.stop().unwrap();
        assert!(
            conversation
                .on_session_event(SessionEvent::TurnComplete(audio_turn()))
                .is_none()
        );

        assert!(
            conversation
                .on_playback_event(PlaybackEvent::Stopped { stream: 0 })
                .is_none()
        );
        let released = conversation.on_playback_event(PlaybackEvent::Complete { stream: 1 });
        assert!(matches!(released, Some(ConversationEvent::TurnComplete(t)) if t.has_audio()));
    }

    #[tokio::test]
    async fn test_interrupt_releases_pending_turn_first() {
        let (handle, events) = crate::core::playback::PlaybackHandle::spawn(
            crate::core::playback::VirtualSink::manual(24000),
            crate::core::playback::PlaybackConfig::default(),
        )
        .unwrap();
        let mut conversation = conversation().with_playback(handle, events);
        conversation.on_session_event(SessionEvent::TurnComplete(audio_turn()));

        let first = conversation.on_session_event(SessionEvent::Interrupted);
        assert!(matches!(first, Some(ConversationEvent::TurnComplete(_))));
        assert!(matches!(
            conversation.deferred,
            Some(ConversationEvent::Session(SessionEvent::Interrupted))
        ));
        assert!(conversation.pending_turn.is_none());
    }

    #[test]
    fn test_cancelled_responses_are_not_sent() {
        let mut conversation = conversation();
        conversation
            .on_session_event(SessionEvent::ToolCallCancellation(vec!["a".to_string()]));
        let call = FunctionCall {
            id: "a".to_string(),
            name: "lookup".to_string(),
            args: serde_json::Value::Null,
        };
        let sent =
            conversation.on_tool_responses(vec![FunctionResponse::error(&call, "cancelled")]);
        assert!(sent.is_none());
        assert!(conversation.cancelled_calls.is_empty());
    }
}
