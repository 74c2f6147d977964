// Broadcast cancellation shared by every thread of one pipeline run.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender};

/// Idempotent, cloneable stop signal.
///
/// Cancelling drops the only sender of a zero-capacity channel, so every
/// clone of the receiver becomes ready at once. Blocking queue operations
/// select on that receiver to wake up promptly.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (trigger, signal) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let mut trigger = self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        trigger.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Receiver that becomes disconnected once the token is cancelled.
    pub(crate) fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-facing handle that stops a dump or restore run.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::{AbortHandle, CancellationToken};
    use std::time::Duration;

    #[test]
    fn cancel_is_visible_to_clones() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.signal().recv().is_err());
    }

    #[test]
    fn signal_wakes_blocked_receivers() {
        let token = CancellationToken::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let token = token.clone();
                std::thread::spawn(move || token.signal().recv().is_err())
            })
            .collect();
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        for waiter in waiters {
            assert!(waiter.join().expect("join"));
        }
    }

    #[test]
    fn signal_stays_pending_until_cancelled() {
        let token = CancellationToken::new();
        assert!(
            token
                .signal()
                .recv_timeout(Duration::from_millis(10))
                .expect_err("pending")
                .is_timeout()
        );
    }

    #[test]
    fn abort_handle_cancels_token() {
        let token = CancellationToken::new();
        let handle = AbortHandle::new(token.clone());
        assert!(!handle.is_aborted());
        handle.abort();
        assert!(token.is_cancelled());
        assert!(handle.is_aborted());
    }
}
