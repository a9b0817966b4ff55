//! Wait-free SPSC rings for crossing the audio-thread boundary.
//!
//! Uses rtrb for wait-free SPSC (Single Producer Single Consumer) ring buffers
//! so the platform audio callback never blocks on the control task.
//!
//! # Real-Time Safety
//!
//! - No heap allocations during push/pop operations
//! - Wait-free (bounded worst-case latency)
//! - No locks or syscalls in the fast path
//!
//! The producer half lives on the device callback thread, the consumer half
//! on the control task. Neither half is `Clone`; ownership is the contract.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rtrb::{Consumer, Producer, RingBuffer};

/// Default ring capacity in samples (~2s at 16kHz).
pub const DEFAULT_SAMPLE_RING_CAPACITY: usize = 32768;

/// Counters shared by both halves of a sample ring.
#[derive(Debug, Default)]
pub struct RingStats {
    capacity: usize,
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
}

impl RingStats {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples accepted by the producer.
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Samples handed to the consumer.
    pub fn popped(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }

    /// Samples discarded because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a sample ring with the given capacity in samples.
pub fn sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    let (producer, consumer) = RingBuffer::new(capacity);
    let stats = Arc::new(RingStats {
        capacity,
        ..Default::default()
    });
    (
        SampleProducer {
            producer,
            stats: stats.clone(),
        },
        SampleConsumer { consumer, stats },
    )
}

/// Producer end, owned by the audio callback.
pub struct SampleProducer {
    producer: Producer<f32>,
    stats: Arc<RingStats>,
}

impl SampleProducer {
    /// Push samples (wait-free).
    ///
    /// Returns the number of samples written. When the ring is full the
    /// excess is dropped and counted; the callback never waits.
    pub fn push(&mut self, data: &[f32]) -> usize {
        let to_write = data.len().min(self.producer.slots());

        if to_write > 0 {
            if let Ok(mut chunk) = self.producer.write_chunk(to_write) {
                let (first, second) = chunk.as_mut_slices();
                let first_len = first.len();
                first.copy_from_slice(&data[..first_len]);
                second.copy_from_slice(&data[first_len..to_write]);
                chunk.commit_all();
            } else {
                return 0;
            }
            self.stats
                .pushed
                .fetch_add(to_write as u64, Ordering::Relaxed);
        }

        let overflow = data.len() - to_write;
        if overflow > 0 {
            self.stats
                .dropped
                .fetch_add(overflow as u64, Ordering::Relaxed);
        }
        to_write
    }

    /// Whether the consumer half has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.producer.is_abandoned()
    }

    pub fn stats(&self) -> &RingStats {
        &self.stats
    }
}

/// Consumer end, owned by the control task.
pub struct SampleConsumer {
    consumer: Consumer<f32>,
    stats: Arc<RingStats>,
}

impl SampleConsumer {
    /// Move every available sample into `out` (wait-free).
    pub fn drain_into(&mut self, out: &mut Vec<f32>) -> usize {
        let available = self.consumer.slots();
        if available == 0 {
            return 0;
        }

        match self.consumer.read_chunk(available) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                out.extend_from_slice(first);
                out.extend_from_slice(second);
                chunk.commit_all();
                self.stats
                    .popped
                    .fetch_add(available as u64, Ordering::Relaxed);
                available
            }
            Err(_) => 0,
        }
    }

    /// Number of samples ready to read.
    pub fn available(&self) -> usize {
        self.consumer.slots()
    }

    /// Whether the producer half has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.consumer.is_abandoned()
    }

    pub fn stats(&self) -> &RingStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_drain_preserves_order() {
        let (mut producer, mut consumer) = sample_ring(8);
        assert_eq!(producer.push(&[0.1, 0.2, 0.3]), 3);
        assert_eq!(consumer.available(), 3);

        let mut out = Vec::new();
        assert_eq!(consumer.drain_into(&mut out), 3);
        assert_eq!(out, vec![0.1, 0.2, 0.3]);
        assert_eq!(consumer.available(), 0);
    }

    #[test]
    fn test_wraparound() {
        let (mut producer, mut consumer) = sample_ring(4);
        let mut out = Vec::new();

        producer.push(&[1.0, 2.0, 3.0]);
        consumer.drain_into(&mut out);
        producer.push(&[4.0, 5.0, 6.0]);
        consumer.drain_into(&mut out);

        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(consumer.stats().popped(), 6);
    }

    #[test]
    fn test_overflow_is_dropped_and_counted() {
        let (mut producer, consumer) = sample_ring(4);
        assert_eq!(producer.push(&[0.0; 6]), 4);
        assert_eq!(producer.stats().dropped(), 2);
        assert_eq!(producer.stats().pushed(), 4);
        assert_eq!(consumer.available(), 4);
    }

    #[test]
    fn test_abandoned_detection() {
        let (producer, consumer) = sample_ring(4);
        drop(producer);
        assert!(consumer.is_abandoned());
    }
}
