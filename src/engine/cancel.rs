//! Cooperative cancellation for scan loops.
//!
//! A [`CancelToken`] is shared between a loop and whoever owns it.  The loop
//! races every suspension point against [`CancelToken::cancelled`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot see a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleeps for `period` unless cancelled first.  Returns `true` when the
    /// full period elapsed.
    pub async fn pause(&self, period: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(period) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        assert!(!waiter.is_finished());
        token.cancel();
        waiter.await.unwrap();
        // Stays cancelled for later waiters.
        assert!(!token.pause(Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn pause_is_cut_short_by_cancel() {
        let token = CancelToken::new();
        token.cancel();
        assert!(!token.pause(Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn pause_completes_when_not_cancelled() {
        let token = CancelToken::new();
        assert!(token.pause(Duration::from_millis(10)).await);
    }
}
