//! Root cancellation signal shared by every long-running wait in the agent.

use std::time::Duration;

use tokio::sync::watch;

/// Receiving side of the process shutdown signal.
///
/// Wraps the `watch::Receiver<bool>` the binary hands out. A dropped sender
/// counts as shutdown, so no wait can outlive the process root.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Create a sender/signal pair.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::new(rx))
    }

    /// Check if shutdown has been signaled.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once shutdown has been signaled.
    pub async fn triggered(&mut self) {
        // An error means the sender is gone, which is treated as shutdown.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Sleep for `duration` unless shutdown comes first.
    ///
    /// Returns `true` if the full duration elapsed, `false` on shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.triggered() => false,
        }
    }
}

impl From<watch::Receiver<bool>> for ShutdownSignal {
    fn from(rx: watch::Receiver<bool>) -> Self {
        Self::new(rx)
    }
}
