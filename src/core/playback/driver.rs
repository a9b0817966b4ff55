//! Playback driver task.
//!
//! Owns the [`PlaybackScheduler`] (and with it the output sink) on a tokio
//! task. Everything else talks to it through a [`PlaybackHandle`], a cheap
//! cloneable command queue; sends never block.
//!
//! Every `stop` ends the current stream and opens the next one. Events carry
//! the id of the stream they belong to, so a consumer can tell a late
//! `Stopped` for an interrupted stream from the end of the stream it is
//! waiting on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::config::PlaybackConfig;
use super::scheduler::PlaybackScheduler;
use super::sink::{AudioSink, PlaybackError, PlaybackResult};
use crate::core::timer::DelayedTask;

/// Slack added to the end-of-playback timer so the output clock has
/// certainly passed the marker when it fires.
const COMPLETION_SLACK: Duration = Duration::from_millis(1);

#[derive(Debug)]
enum PlaybackCommand {
    Push(Bytes),
    Complete,
    Stop,
    Resume,
    Shutdown,
}

/// Notifications from the playback driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The first buffer of a new stream was queued
    Started { stream: u64 },
    /// A completed stream finished playing
    Complete { stream: u64 },
    /// Playback was stopped and cleared
    Stopped { stream: u64 },
}

impl PlaybackEvent {
    pub fn stream(&self) -> u64 {
        match *self {
            Self::Started { stream } | Self::Complete { stream } | Self::Stopped { stream } => {
                stream
            }
        }
    }
}

/// Command queue into a running playback driver.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<PlaybackCommand>,
    /// Stops issued through any clone of this handle
    stream: Arc<AtomicU64>,
}

/// Receiver for [`PlaybackEvent`]s.
#[derive(Debug)]
pub struct PlaybackEvents {
    rx: mpsc::UnboundedReceiver<PlaybackEvent>,
}

impl PlaybackEvents {
    pub async fn recv(&mut self) -> Option<PlaybackEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PlaybackEvent> {
        self.rx.try_recv().ok()
    }
}

impl PlaybackHandle {
    /// Start a driver task for `sink`. Must be called within a tokio runtime.
    pub fn spawn<S: AudioSink>(
        sink: S,
        config: PlaybackConfig,
    ) -> PlaybackResult<(PlaybackHandle, PlaybackEvents)> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(
            "Starting playback driver ({}Hz, {} samples per buffer)",
            config.sample_rate, config.buffer_samples
        );
        tokio::spawn(run_driver(
            PlaybackScheduler::new(sink, config.clone()),
            config.tick_interval(),
            rx,
            event_tx,
        ));

        Ok((
            Self {
                tx,
                stream: Arc::new(AtomicU64::new(0)),
            },
            PlaybackEvents { rx: event_rx },
        ))
    }

    fn send(&self, command: PlaybackCommand) -> PlaybackResult<()> {
        self.tx.send(command).map_err(|_| PlaybackError::Closed)
    }

    /// Queue PCM16 bytes for playback.
    pub fn push(&self, pcm: Bytes) -> PlaybackResult<()> {
        self.send(PlaybackCommand::Push(pcm))
    }

    /// Mark the end of the current stream.
    pub fn complete(&self) -> PlaybackResult<()> {
        self.send(PlaybackCommand::Complete)
    }

    /// Fade out and discard everything queued. Audio pushed afterwards
    /// belongs to the next stream.
    pub fn stop(&self) -> PlaybackResult<()> {
        self.stream.fetch_add(1, Ordering::AcqRel);
        self.send(PlaybackCommand::Stop)
    }

    /// Id of the stream that audio pushed now would join.
    pub fn stream_id(&self) -> u64 {
        self.stream.load(Ordering::Acquire)
    }

    pub fn resume(&self) -> PlaybackResult<()> {
        self.send(PlaybackCommand::Resume)
    }

    /// Stop playback and end the driver task.
    pub fn shutdown(&self) -> PlaybackResult<()> {
        self.send(PlaybackCommand::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_driver<S: AudioSink>(
    mut scheduler: PlaybackScheduler<S>,
    tick_interval: Duration,
    mut commands: mpsc::UnboundedReceiver<PlaybackCommand>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let (fired_tx, mut fired_rx) = mpsc::unbounded_channel::<u64>();
    let mut completion: Option<DelayedTask> = None;
    let mut epoch: u64 = 0;
    let mut stream: u64 = 0;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PlaybackCommand::Push(pcm)) => {
                    let was_playing = scheduler.is_playing();
                    completion = None;
                    scheduler.push_pcm16(&pcm);
                    scheduler.schedule_pass();
                    if !was_playing && scheduler.is_playing() {
                        let _ = events.send(PlaybackEvent::Started { stream });
                    }
                }
                Some(PlaybackCommand::Complete) => {
                    scheduler.complete();
                    scheduler.schedule_pass();
                }
                Some(PlaybackCommand::Stop) => {
                    completion = None;
                    scheduler.stop();
                    let _ = events.send(PlaybackEvent::Stopped { stream });
                    stream += 1;
                }
                Some(PlaybackCommand::Resume) => scheduler.resume(),
                Some(PlaybackCommand::Shutdown) | None => {
                    scheduler.stop();
                    break;
                }
            },
            _ = ticker.tick() => {
                scheduler.schedule_pass();
                if scheduler.poll_complete() {
                    completion = None;
                    let _ = events.send(PlaybackEvent::Complete { stream });
                }
            }
            Some(fired) = fired_rx.recv() => {
                if fired == epoch {
                    completion = None;
                    if scheduler.poll_complete() {
                        debug!("Playback stream {} complete", stream);
                        let _ = events.send(PlaybackEvent::Complete { stream });
                    }
                }
            }
        }

        if completion.is_none()
            && let Some(delay) = scheduler.completion_delay()
        {
            epoch += 1;
            let tx = fired_tx.clone();
            let id = epoch;
            completion = Some(DelayedTask::spawn(delay + COMPLETION_SLACK, async move {
                let _ = tx.send(id);
            }));
        }
    }

    debug!("Playback driver ended");
}
