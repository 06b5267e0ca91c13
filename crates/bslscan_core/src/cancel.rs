//! Cooperative cancellation for in-flight scans.
//!
//! A `CancelToken` travels with one `execute` call and is watched by the
//! process invoker while it waits on the external scanner. Built on
//! `tokio::sync::watch` so a cancel reaches a suspended attempt without
//! polling. Cancellation stops the currently running attempt only; it does
//! not interrupt an in-progress file repair write.

use tokio::sync::watch;

/// Sending half: owned by the caller (SIGINT handler, service guard).
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Receiving half: cloned into each scan attempt.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    /// Request cancellation of the scan this handle is paired with.
    pub fn cancel(&self) {
        // Receivers may already be gone when the scan finished first.
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// A token that can never fire, for callers without a cancel path.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        CancelToken { rx }
    }

    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves for a
    /// `never()` token or after the paired handle is dropped un-fired.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped without firing: no cancel can arrive anymore.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_fires() {
        let (handle, mut token) = cancel_pair();
        assert!(!token.is_cancelled());

        handle.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_token_does_not_resolve() {
        let mut token = CancelToken::never();
        assert!(!token.is_cancelled());

        let waited =
            tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(waited.is_err(), "never() token must not resolve");
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_resolve() {
        let (handle, mut token) = cancel_pair();
        drop(handle);

        let waited =
            tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(waited.is_err(), "dropped handle must not cancel the scan");
    }

    #[tokio::test]
    async fn test_cancel_before_wait_resolves_immediately() {
        let (handle, mut token) = cancel_pair();
        handle.cancel();
        token.cancelled().await;
    }
}
