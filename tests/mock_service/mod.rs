//! Scripted in-process live service.
//!
//! Accepts one WebSocket connection. Every text frame the client sends is
//! parsed and handed to the test; the test pushes server frames, a close or
//! an abrupt drop through [`MockService::send`], [`MockService::close`] and
//! [`MockService::drop_connection`].

#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use waav_live::core::audio::encode_frame;
use waav_live::{SessionConfig, SessionEvent, SessionEvents};

pub enum MockAction {
    Text(String),
    Close(String),
    /// Drop the socket without a closing handshake
    Drop,
}

pub struct MockService {
    pub endpoint: String,
    frames: mpsc::UnboundedReceiver<Value>,
    actions: mpsc::UnboundedSender<MockAction>,
}

impl MockService {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (actions, mut action_rx) = mpsc::unbounded_channel::<MockAction>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            let (mut write, mut read) = ws.split();
            loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            let value: Value = serde_json::from_str(text.as_str()).unwrap();
                            let _ = frame_tx.send(value);
                        }
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => {}
                    },
                    action = action_rx.recv() => match action {
                        Some(MockAction::Text(text)) => {
                            if write.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(MockAction::Close(reason)) => {
                            let _ = write
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                        Some(MockAction::Drop) | None => break,
                    },
                }
            }
        });

        Self {
            endpoint: format!("ws://{}/live", addr),
            frames,
            actions,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new("test-key");
        config.endpoint = self.endpoint.clone();
        config
    }

    pub fn send(&self, frame: Value) {
        let _ = self.actions.send(MockAction::Text(frame.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.actions.send(MockAction::Text(text.to_string()));
    }

    pub fn close(&self, reason: &str) {
        let _ = self.actions.send(MockAction::Close(reason.to_string()));
    }

    pub fn drop_connection(&self) {
        let _ = self.actions.send(MockAction::Drop);
    }

    /// Next frame the client sent.
    pub async fn next_frame(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("mock connection ended")
    }

    /// Whether the client sends anything within `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.frames.recv()).await.is_err()
    }
}

pub fn setup_complete() -> Value {
    json!({ "setupComplete": {} })
}

pub fn text_part(text: &str) -> Value {
    json!({ "serverContent": { "modelTurn": { "parts": [{ "text": text }] } } })
}

pub fn audio_part(pcm: &[u8]) -> Value {
    json!({
        "serverContent": {
            "modelTurn": {
                "parts": [{
                    "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": encode_frame(pcm) }
                }]
            }
        }
    })
}

pub fn turn_complete() -> Value {
    json!({ "serverContent": { "turnComplete": true } })
}

pub fn interrupted() -> Value {
    json!({ "serverContent": { "interrupted": true } })
}

/// Wait for the first event matching `pred`, returning it and everything
/// skipped on the way.
pub async fn wait_for<F>(events: &mut SessionEvents, pred: F) -> (SessionEvent, Vec<SessionEvent>)
where
    F: Fn(&SessionEvent) -> bool,
{
    let mut skipped = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed");
        if pred(&event) {
            return (event, skipped);
        }
        skipped.push(event);
    }
}

/// Drain whatever is already queued.
pub fn drain(events: &mut SessionEvents) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Some(event) = events.try_recv() {
        out.push(event);
    }
    out
}
