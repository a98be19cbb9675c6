//! Shared cancellation token.
//!
//! One token is created per pipeline and cloned into every stage and the queue
//! worker. Cancelling drops the only sender of an internal channel, so every
//! clone's [`CancellationToken::cancelled`] receiver becomes ready at once and can
//! sit in a `select!` next to the stage's input channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

/// Cloneable, thread-safe cancellation signal.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let mut trigger = self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        trigger.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) once the token fires.
    ///
    /// Nothing is ever sent on it; use it only as a `select!` arm.
    pub fn cancelled(&self) -> &Receiver<()> {
        &self.inner.signal
    }

    /// Sleep for up to `timeout`, returning early with `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.inner.signal.recv_timeout(timeout) {
            Ok(()) => true,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => true,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => self.is_cancelled(),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn clones_observe_cancellation() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.cancelled().recv().is_err());

        // Second cancel is a no-op.
        token.cancel();
    }

    #[test]
    fn wait_timeout_returns_early_on_cancel() {
        let token = CancellationToken::new();
        let clone = token.clone();

        let waiter = std::thread::spawn(move || {
            let started = Instant::now();
            let cancelled = clone.wait_timeout(Duration::from_secs(10));
            (cancelled, started.elapsed())
        });

        std::thread::sleep(Duration::from_millis(20));
        token.cancel();

        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn wait_timeout_elapses_without_cancel() {
        let token = CancellationToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(5)));
    }
}
