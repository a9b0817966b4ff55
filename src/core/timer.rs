//! Cancellable delayed tasks.
//!
//! A [`DelayedTask`] is owned by the component that starts it. Cancelling it
//! (explicitly or by dropping it) guarantees the wrapped future never runs,
//! so `stop()` paths never leak a pending callback.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A future scheduled to run once after a delay.
#[derive(Debug)]
pub struct DelayedTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DelayedTask {
    /// Spawn `task` to run after `delay` on the current tokio runtime.
    pub fn spawn<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = child.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !child.is_cancelled() {
                        task.await;
                    }
                }
            }
        });
        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Cancel the task. Synchronous: once this returns the task will not fire.
    pub fn cancel(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the delay elapsed and the task ran to completion.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_finished()) && !self.is_cancelled()
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _task = DelayedTask::spawn(Duration::from_millis(100), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut task = DelayedTask::spawn(Duration::from_millis(100), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        task.cancel();
        assert!(task.is_cancelled());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        drop(DelayedTask::spawn(Duration::from_millis(10), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
