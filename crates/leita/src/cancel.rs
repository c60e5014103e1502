//! Cooperative cancellation, checked only at step boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A token polled by the orchestrator between steps. Never inspected inside
/// a step: cancellation takes effect at the next step boundary and aborts
/// the request with no partial output.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token and the handle that can trigger it.
    pub fn new() -> (Self, CancellationHandle) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let token = CancellationToken {
            cancelled: cancelled.clone(),
        };
        (token, CancellationHandle { cancelled })
    }

    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// The signalling side of a [`CancellationToken`] pair.
#[derive(Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Auto-cancels after `timeout` elapses.
    pub fn cancel_after(&self, timeout: std::time::Duration) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            handle.cancel();
        });
    }
}
