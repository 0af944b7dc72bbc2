//! Cooperative cancellation (§5 "A single AbortSignal per agent prompt").
//!
//! A minimal abort-signal/controller pair built on `tokio::sync::Notify`, used by the
//! provider stream consumer, the rate limiter's waiters, the request queue's active items,
//! and the retry backoff sleep. Firing the signal is idempotent and instantaneous; anyone
//! awaiting [`AbortSignal::cancelled`] wakes up promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    fired: AtomicBool,
    notify: Notify,
}

/// The observer half: cheaply cloneable, handed to anything that must stop promptly when
/// cancellation fires.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    inner: Arc<Inner>,
}

/// The owner half: exactly one per in-flight agent prompt.
#[derive(Clone, Debug)]
pub struct AbortController {
    inner: Arc<Inner>,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            inner: self.inner.clone(),
        }
    }

    /// Fire the signal. Safe to call more than once.
    pub fn abort(&self) {
        if !self.inner.fired.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Resolve once the signal fires. Resolves immediately if it already has.
    pub async fn cancelled(&self) {
        if self.is_aborted() {
            return;
        }
        // Notify::notified() must be constructed before re-checking the flag to avoid missing
        // a notification delivered between the check above and this call.
        let notified = self.inner.notify.notified();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }

    /// A signal that never fires, for call sites with no cancellation source.
    pub fn never() -> Self {
        AbortController::new().signal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_after_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());
        controller.abort();
        assert!(signal.is_aborted());
        signal.cancelled().await;
    }

    #[tokio::test]
    async fn double_abort_is_harmless() {
        let controller = AbortController::new();
        controller.abort();
        controller.abort();
        assert!(controller.signal().is_aborted());
    }
}
