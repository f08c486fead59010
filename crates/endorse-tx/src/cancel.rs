//! Cooperative cancellation signal shared by every suspension point.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

/// Cloneable cancellation signal.
///
/// All clones observe the same state. Once fired, a signal stays fired.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    /// Shared flag and wakeup notifier.
    inner: Arc<CancelState>,
}

/// Shared state behind a [`CancelSignal`].
#[derive(Debug, Default)]
struct CancelState {
    /// Set once cancellation fires.
    cancelled: AtomicBool,
    /// Wakes tasks blocked in [`CancelSignal::cancelled`].
    notify: Notify,
}

impl CancelSignal {
    /// Creates an unfired signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal and wakes every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Returns true once the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves when the signal fires; resolves immediately if it already has.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
