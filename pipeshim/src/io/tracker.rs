//! Completion tracking for relay tasks.
//!
//! Each tracked relay holds a [`CompletionGuard`] for its whole lifetime.
//! The guard decrements the count when dropped, so a relay that fails or
//! panics still releases its slot exactly once.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// Counts outstanding relay tasks for one process.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    count: Mutex<usize>,
    zero: Notify,
}

impl CompletionTracker {
    /// Create an empty tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve a slot before a relay starts.
    pub fn register(self: &Arc<Self>) -> CompletionGuard {
        *self.count.lock() += 1;
        CompletionGuard {
            tracker: Arc::clone(self),
        }
    }

    /// Number of relays still running.
    pub fn outstanding(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until every registered relay has finished.
    ///
    /// Returns immediately when nothing is registered.
    pub async fn wait(&self) {
        loop {
            // Created before the check so a release between check and await is not lost.
            let notified = self.zero.notified();
            if *self.count.lock() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        let mut count = self.count.lock();
        match count.checked_sub(1) {
            Some(remaining) => {
                *count = remaining;
                if remaining == 0 {
                    drop(count);
                    self.zero.notify_waiters();
                }
            }
            None => tracing::warn!("completion tracker released below zero, ignoring"),
        }
    }
}

/// One registered slot in a [`CompletionTracker`].
#[derive(Debug)]
#[must_use = "dropping the guard immediately marks the relay as done"]
pub struct CompletionGuard {
    tracker: Arc<CompletionTracker>,
}

impl CompletionGuard {
    /// Mark the relay as finished.
    pub fn done(self) {
        drop(self);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.tracker.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_empty() {
        let tracker = CompletionTracker::new();
        tokio::time::timeout(Duration::from_millis(100), tracker.wait())
            .await
            .expect("empty tracker should not block");
    }

    #[tokio::test]
    async fn test_wait_blocks_until_all_done() {
        let tracker = CompletionTracker::new();
        let first = tracker.register();
        let second = tracker.register();
        assert_eq!(tracker.outstanding(), 2);

        first.done();
        assert_eq!(tracker.outstanding(), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), tracker.wait())
                .await
                .is_err(),
            "wait must not return while a relay is outstanding"
        );

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(second);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_guard_released_on_panic() {
        let tracker = CompletionTracker::new();
        let guard = tracker.register();
        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("relay blew up");
        });
        assert!(task.await.is_err());
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_release_never_goes_negative() {
        let tracker = CompletionTracker::new();
        tracker.release();
        assert_eq!(tracker.outstanding(), 0);
        let guard = tracker.register();
        assert_eq!(tracker.outstanding(), 1);
        drop(guard);
        assert_eq!(tracker.outstanding(), 0);
    }
}
