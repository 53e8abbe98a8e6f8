//! Signal-of-Stop: cooperative cancellation token.
//!
//! Clones share one flag. Work loops poll [`SignalOfStop::cancelled`]
//! between units of work; async code can await [`SignalOfStop::wait`] or
//! race a future with [`SignalOfStop::run_until`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    stopped: AtomicBool,
    notify: Notify,
}

#[derive(Debug, Default, Clone)]
pub struct SignalOfStop {
    shared: Arc<Shared>,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Idempotent.
    pub fn cancel(&self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            self.shared.notify.notify_waiters();
        }
    }

    pub fn cancelled(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Resolve once the signal is raised (immediately if it already is).
    pub async fn wait(&self) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not lost.
            notified.as_mut().enable();
            if self.cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Drive `fut` until it completes or the signal is raised.
    ///
    /// Returns `None` when the signal won.
    pub async fn run_until<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.wait() => None,
            res = fut => Some(res),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_after_cancel_from_clone() {
        let sos = SignalOfStop::new();
        let clone = sos.clone();
        let waiter = tokio::spawn(async move { clone.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        sos.cancel();
        waiter.await.unwrap();
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn run_until_prefers_signal_when_already_cancelled() {
        let sos = SignalOfStop::new();
        sos.cancel();
        assert_eq!(sos.run_until(async { 5 }).await, None);
    }

    #[tokio::test]
    async fn run_until_returns_future_output() {
        let sos = SignalOfStop::new();
        assert_eq!(sos.run_until(async { 7 }).await, Some(7));
    }
}
