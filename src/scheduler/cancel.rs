//! Operator-level cancellation.
//!
//! A `CancelSignal` is cloned into every part of a cycle. Once cancelled it
//! stays cancelled; there is no reset.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

/// Raised when work stops because of cancellation rather than failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Interrupted by operator")]
pub struct Interrupted;

/// Shared, one-shot cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Completes once the signal has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Returns `Err(Interrupted)` if cancellation was requested.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_cancelled() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Cancels `signal` on SIGINT or SIGTERM (Ctrl-C elsewhere).
pub fn install_signal_handlers(signal: CancelSignal) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        let mut sigint = unix_signal(SignalKind::interrupt())?;
        let mut sigterm = unix_signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => tracing::warn!("Received SIGINT, cancelling"),
                _ = sigterm.recv() => tracing::warn!("Received SIGTERM, cancelling"),
            }
            signal.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Received Ctrl-C, cancelling");
                signal.cancel();
            }
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_sticky() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert!(signal.check().is_ok());

        let clone = signal.clone();
        clone.cancel();
        assert!(signal.is_cancelled());
        assert_eq!(signal.check(), Err(Interrupted));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let signal = CancelSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let signal = CancelSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .unwrap();
    }
}
