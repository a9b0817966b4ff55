//! Jitter-buffered playback scheduling.
//!
//! Model audio arrives in irregular bursts. Incoming PCM16 is decoded into a
//! processing buffer; every time it reaches `buffer_samples` a ready buffer
//! is cut and queued. A scheduling pass hands ready buffers to the sink at
//! `max(scheduled_time, now)` and advances the cursor by each buffer's
//! duration, so consecutive buffers abut exactly.
//!
//! ```text
//! push_pcm16 ──► processing ──(full)──► queue ──schedule_pass──► sink
//!                                                  │
//!                               scheduled_time ◄───┘ (+ duration)
//! ```
//!
//! When playback (re)starts the cursor is placed `initial_buffer_delay`
//! ahead of the output clock: the jitter buffer. Buffers are only scheduled
//! while the cursor is within `schedule_ahead` of the clock, keeping the
//! amount of audio committed to the device (and lost on `stop`) small.
//!
//! Completion is tracked by an end-of-playback marker on the final buffer
//! of a completed stream, never by queue emptiness: scheduled buffers keep
//! playing after they leave the queue.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::config::PlaybackConfig;
use super::sink::AudioSink;
use crate::core::audio::pcm;

pub struct PlaybackScheduler<S: AudioSink> {
    sink: S,
    config: PlaybackConfig,
    /// Partial-buffer residue
    processing: Vec<f32>,
    /// Odd trailing byte from the previous push
    carry: Option<u8>,
    queue: VecDeque<Vec<f32>>,
    scheduled_time: f64,
    playing: bool,
    stream_complete: bool,
    /// Output clock time at which the final buffer ends
    end_marker: Option<f64>,
    buffers_scheduled: u64,
}

impl<S: AudioSink> PlaybackScheduler<S> {
    pub fn new(sink: S, config: PlaybackConfig) -> Self {
        if sink.sample_rate() != config.sample_rate {
            warn!(
                "Sink expects {}Hz but playback is configured for {}Hz",
                sink.sample_rate(),
                config.sample_rate
            );
        }
        let scheduled_time = sink.current_time();
        Self {
            sink,
            processing: Vec::with_capacity(config.buffer_samples),
            config,
            carry: None,
            queue: VecDeque::new(),
            scheduled_time,
            playing: false,
            stream_complete: false,
            end_marker: None,
            buffers_scheduled: 0,
        }
    }

    /// Decode PCM16 bytes into the processing buffer, cutting full buffers.
    ///
    /// Reopens a completed stream: audio after `complete()` belongs to a new
    /// stream and postpones the completion signal.
    pub fn push_pcm16(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.stream_complete = false;
        self.end_marker = None;

        let mut rest = bytes;
        if let Some(low) = self.carry.take() {
            self.processing
                .push(pcm::normalize_sample(i16::from_le_bytes([low, rest[0]])));
            rest = &rest[1..];
        }
        pcm::decode_pcm16_into(rest, &mut self.processing);
        if rest.len() % 2 == 1 {
            self.carry = rest.last().copied();
        }

        let size = self.config.buffer_samples;
        while self.processing.len() >= size {
            let remainder = self.processing.split_off(size);
            let ready = std::mem::replace(&mut self.processing, remainder);
            self.queue.push_back(ready);
        }

        if !self.playing {
            self.playing = true;
            self.scheduled_time = self.sink.current_time() + self.config.initial_buffer_delay;
            debug!(
                "Playback starting, first buffer at {:.3}s",
                self.scheduled_time
            );
        }
        trace!(
            "Pushed {} bytes, {} queued, {} samples pending",
            bytes.len(),
            self.queue.len(),
            self.processing.len()
        );
    }

    /// Schedule ready buffers that start within the look-ahead window.
    ///
    /// Returns the number of buffers handed to the sink.
    pub fn schedule_pass(&mut self) -> usize {
        if !self.playing {
            return 0;
        }

        let now = self.sink.current_time();
        let horizon = now + self.config.schedule_ahead;
        let mut count = 0;

        while self.scheduled_time < horizon {
            let Some(buffer) = self.queue.pop_front() else {
                break;
            };
            let start = self.scheduled_time.max(now);
            let duration = buffer.len() as f64 / self.config.sample_rate as f64;
            if let Err(e) = self.sink.schedule(start, buffer) {
                warn!("Failed to schedule playback buffer: {}", e);
                continue;
            }
            self.scheduled_time = start + duration;
            self.buffers_scheduled += 1;
            count += 1;
        }

        self.mark_end_if_drained(now);
        count
    }

    /// Mark the end of the stream. The partial residue is flushed as one
    /// final short buffer so completion can fire.
    pub fn complete(&mut self) {
        self.stream_complete = true;
        self.carry = None;
        if !self.processing.is_empty() {
            let tail = std::mem::take(&mut self.processing);
            self.queue.push_back(tail);
        }
        let now = self.sink.current_time();
        if !self.playing {
            // Nothing was ever scheduled; complete right away.
            self.end_marker = Some(now);
            return;
        }
        self.mark_end_if_drained(now);
    }

    fn mark_end_if_drained(&mut self, now: f64) {
        if self.stream_complete
            && self.end_marker.is_none()
            && self.queue.is_empty()
            && self.processing.is_empty()
        {
            self.end_marker = Some(self.scheduled_time.max(now));
            debug!("Playback stream ends at {:.3}s", self.scheduled_time);
        }
    }

    /// Fade to silence, clear everything pending and reset the cursor.
    pub fn stop(&mut self) {
        self.sink.fade_out_and_clear(self.config.fade_out);
        self.queue.clear();
        self.processing.clear();
        self.carry = None;
        self.playing = false;
        self.stream_complete = false;
        self.end_marker = None;
        self.scheduled_time = self.sink.current_time();
        debug!("Playback stopped");
    }

    /// Re-arm the jitter buffer and restore full gain.
    ///
    /// The cursor never moves backwards: while buffers are still scheduled
    /// only the gain is restored.
    pub fn resume(&mut self) {
        if !self.playing {
            self.stream_complete = false;
            self.end_marker = None;
            let rearmed = self.sink.current_time() + self.config.initial_buffer_delay;
            self.scheduled_time = self.scheduled_time.max(rearmed);
        }
        self.sink.set_gain(1.0);
        debug!("Playback resumed, next buffer at {:.3}s", self.scheduled_time);
    }

    /// Returns `true` exactly once when a completed stream has finished
    /// playing on the output clock.
    pub fn poll_complete(&mut self) -> bool {
        match self.end_marker {
            Some(end) if self.sink.current_time() >= end => {
                self.end_marker = None;
                self.stream_complete = false;
                self.playing = false;
                true
            }
            _ => false,
        }
    }

    /// Time until the end-of-playback marker is reached, if one is set.
    pub fn completion_delay(&self) -> Option<Duration> {
        self.end_marker.map(|end| {
            let remaining = (end - self.sink.current_time()).max(0.0);
            Duration::from_secs_f64(remaining)
        })
    }

    /// Bytes of PCM16 waiting in the processing buffer.
    pub fn processing_bytes(&self) -> usize {
        self.processing.len() * 2 + usize::from(self.carry.is_some())
    }

    pub fn queued_buffers(&self) -> usize {
        self.queue.len()
    }

    pub fn buffers_scheduled(&self) -> u64 {
        self.buffers_scheduled
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn scheduled_time(&self) -> f64 {
        self.scheduled_time
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::playback::sink::{SinkMonitor, VirtualClock, VirtualSink};

    fn scheduler() -> (PlaybackScheduler<VirtualSink>, VirtualClock, SinkMonitor) {
        let sink = VirtualSink::manual(24000);
        let clock = sink.clock();
        let monitor = sink.monitor();
        (
            PlaybackScheduler::new(sink, PlaybackConfig::default()),
            clock,
            monitor,
        )
    }

    /// Run passes, advancing the clock, until the queue drains.
    fn drain(scheduler: &mut PlaybackScheduler<VirtualSink>, clock: &VirtualClock) {
        for _ in 0..1000 {
            scheduler.schedule_pass();
            if scheduler.queued_buffers() == 0 {
                return;
            }
            clock.advance(0.05);
        }
        panic!("queue never drained");
    }

    #[test]
    fn test_k_buffers_and_r_residue() {
        let buffer_bytes = PlaybackConfig::default().buffer_bytes();
        for (k, r) in [(0, 0), (1, 0), (3, 1234), (5, buffer_bytes - 2), (2, 1)] {
            let (mut s, clock, monitor) = scheduler();
            let bytes = vec![0u8; k * buffer_bytes + r];
            // Irregular burst sizes.
            for chunk in bytes.chunks(3001) {
                s.push_pcm16(chunk);
                s.schedule_pass();
            }
            drain(&mut s, &clock);

            assert_eq!(s.buffers_scheduled(), k as u64, "k={} r={}", k, r);
            assert_eq!(monitor.scheduled_count(), k);
            assert_eq!(s.processing_bytes(), r, "k={} r={}", k, r);
        }
    }

    #[test]
    fn test_first_buffer_waits_for_jitter_delay() {
        let (mut s, clock, monitor) = scheduler();
        clock.advance(1.0);
        s.push_pcm16(&vec![0u8; 2 * 7680]);
        s.schedule_pass();

        let first = &monitor.scheduled()[0];
        assert!((first.start - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_buffers_are_gapless_and_in_order() {
        let (mut s, clock, monitor) = scheduler();
        s.push_pcm16(&vec![0u8; 4 * 2 * 7680]);
        drain(&mut s, &clock);

        let buffers = monitor.scheduled();
        assert_eq!(buffers.len(), 4);
        for pair in buffers.windows(2) {
            assert!((pair[1].start - pair[0].end()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_schedule_ahead_window_limits_commitment() {
        let (mut s, _clock, monitor) = scheduler();
        s.push_pcm16(&vec![0u8; 4 * 2 * 7680]);
        // Cursor starts at 0.1 (< 0.2 horizon); the first buffer pushes it to 0.42.
        assert_eq!(s.schedule_pass(), 1);
        assert_eq!(monitor.scheduled_count(), 1);
        assert_eq!(s.queued_buffers(), 3);
    }

    #[test]
    fn test_late_buffer_starts_now() {
        let (mut s, clock, monitor) = scheduler();
        s.push_pcm16(&vec![0u8; 2 * 7680]);
        s.schedule_pass();
        // Underrun: the clock passes the cursor before more data arrives.
        clock.advance(5.0);
        s.push_pcm16(&vec![0u8; 2 * 7680]);
        s.schedule_pass();

        let buffers = monitor.scheduled();
        assert!((buffers[1].start - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_odd_byte_carried_between_pushes() {
        let (mut s, _clock, _monitor) = scheduler();
        s.push_pcm16(&[0x00, 0x40, 0x00]);
        assert_eq!(s.processing_bytes(), 3);
        s.push_pcm16(&[0x40]);
        assert_eq!(s.processing_bytes(), 4);
    }

    #[test]
    fn test_complete_fires_after_last_buffer_ends() {
        let (mut s, clock, monitor) = scheduler();
        s.push_pcm16(&vec![0u8; 2 * 7680 + 480]);
        s.complete();
        drain(&mut s, &clock);

        let last_end = monitor.scheduled().last().unwrap().end();
        assert_eq!(monitor.scheduled_count(), 2);

        while clock.now() < last_end - 1e-6 {
            assert!(!s.poll_complete());
            clock.advance(0.01);
        }
        clock.advance(0.01);
        assert!(s.poll_complete());
        assert!(!s.poll_complete(), "fires once");
    }

    #[test]
    fn test_complete_without_audio_is_immediate() {
        let (mut s, _clock, _monitor) = scheduler();
        s.complete();
        assert_eq!(s.completion_delay(), Some(Duration::ZERO));
        assert!(s.poll_complete());
    }

    #[test]
    fn test_push_after_complete_postpones_completion() {
        let (mut s, clock, _monitor) = scheduler();
        s.push_pcm16(&vec![0u8; 960]);
        s.complete();
        s.schedule_pass();
        assert!(s.completion_delay().is_some());

        s.push_pcm16(&vec![0u8; 960]);
        assert!(s.completion_delay().is_none());
        clock.advance(10.0);
        assert!(!s.poll_complete());
    }

    #[test]
    fn test_stop_fades_and_clears() {
        let (mut s, clock, monitor) = scheduler();
        s.push_pcm16(&vec![0u8; 3 * 2 * 7680 + 100]);
        s.schedule_pass();
        s.complete();
        clock.advance(0.05);
        s.stop();

        assert_eq!(s.queued_buffers(), 0);
        assert_eq!(s.processing_bytes(), 0);
        assert!(s.completion_delay().is_none());
        assert_eq!(monitor.fades(), vec![0.05]);
        assert!(monitor.live_buffers().is_empty());
        assert_eq!(s.schedule_pass(), 0);

        // Reusable after stop: the jitter delay is re-applied.
        s.push_pcm16(&vec![0u8; 2 * 7680]);
        s.schedule_pass();
        let live = monitor.live_buffers();
        assert_eq!(live.len(), 1);
        assert!((live[0].start - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_resume_rearms_jitter_delay() {
        let (mut s, clock, monitor) = scheduler();
        s.push_pcm16(&vec![0u8; 2 * 7680]);
        s.stop();
        clock.advance(2.0);
        s.resume();
        assert!((s.scheduled_time() - 2.1).abs() < 1e-9);
        assert_eq!(monitor.gain(), 1.0);
    }

    #[test]
    fn test_resume_while_playing_keeps_cursor() {
        let (mut s, clock, monitor) = scheduler();
        s.push_pcm16(&vec![0u8; 4 * 2 * 7680]);
        s.schedule_pass();
        let cursor = s.scheduled_time();

        clock.advance(0.15);
        s.resume();
        assert!((s.scheduled_time() - cursor).abs() < 1e-9);

        drain(&mut s, &clock);
        let buffers = monitor.scheduled();
        assert_eq!(buffers.len(), 4);
        for pair in buffers.windows(2) {
            assert!(pair[1].start >= pair[0].end() - 1e-9, "overlapping buffers");
        }
    }

    #[test]
    fn test_resume_keeps_pending_completion() {
        let (mut s, clock, _monitor) = scheduler();
        s.push_pcm16(&vec![0u8; 960]);
        s.complete();
        s.schedule_pass();
        let delay = s.completion_delay();
        assert!(delay.is_some());

        s.resume();
        assert_eq!(s.completion_delay(), delay);
        clock.advance(1.0);
        assert!(s.poll_complete());
    }
}
