//! Session cancellation signal.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Latched cancellation flag shared across one sync session.
#[derive(Debug, Default)]
pub(crate) struct Cancellation {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// Latch the flag and wake every waiter.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Clear the flag at the start of a new session.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            // Register for the wakeup before checking the flag so a trigger
            // between the check and the await cannot be missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
