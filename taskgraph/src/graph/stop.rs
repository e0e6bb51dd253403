//! Graceful stop requests for a running graph.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    reason: RwLock<Option<String>>,
    notify: Notify,
}

/// A cloneable handle for stopping a graph run.
///
/// Stopping is idempotent; only the first reason is kept. After a stop the
/// runtime seeds nothing more, lets queued items drain, and kills worker
/// processes that outlive the join grace period.
#[derive(Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

impl StopHandle {
    /// Creates a handle that has not been stopped.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop.
    pub fn stop(&self, reason: impl Into<String>) {
        if self
            .inner
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.inner.reason.write() = Some(reason.into());
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns whether a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Returns the stop reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// Resolves once a stop was requested.
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Clears the stop so the handle can serve another run.
    pub fn reset(&self) {
        self.inner.stopped.store(false, Ordering::SeqCst);
        *self.inner.reason.write() = None;
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("stopped", &self.is_stopped())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let handle = StopHandle::new();
        assert!(!handle.is_stopped());

        handle.stop("first");
        handle.clone().stop("second");

        assert!(handle.is_stopped());
        assert_eq!(handle.reason().as_deref(), Some("first"));

        handle.reset();
        assert!(!handle.is_stopped());
        assert!(handle.reason().is_none());
    }

    #[tokio::test]
    async fn test_stopped_wakes_waiters() {
        let handle = StopHandle::new();
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.stopped().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.stop("shutdown");

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_returns_at_once_when_already_stopped() {
        let handle = StopHandle::new();
        handle.stop("early");
        tokio::time::timeout(Duration::from_millis(100), handle.stopped())
            .await
            .unwrap();
    }
}
