//! Cooperative cancellation tokens.
//!
//! A token cancels its whole subtree: a worker invocation gets a child of
//! the session token, optionally with a deadline, and observes either
//! source through the same handle. Watch channels carry the signal so a
//! `select!` arm can await it without polling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    ancestors: Vec<watch::Receiver<bool>>,
}

impl CancelToken {
    /// A fresh root token, not yet cancelled.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            ancestors: Vec::new(),
        }
    }

    /// Derive a child token: cancelling the parent cancels the child, but
    /// cancelling the child leaves the parent alone.
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.tx.subscribe());
        Self {
            tx: Arc::new(tx),
            ancestors,
        }
    }

    /// Derive a child that additionally self-cancels after `deadline`.
    pub fn deadline_child(&self, deadline: Duration) -> Self {
        let child = self.child();
        let timer = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });
        child
    }

    /// Signal cancellation to this token and every child derived from it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow() || self.ancestors.iter().any(|rx| *rx.borrow())
    }

    /// Resolve once this token (or any ancestor) is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rxs: Vec<watch::Receiver<bool>> = self.ancestors.clone();
        rxs.push(self.tx.subscribe());
        let waits: Vec<_> = rxs
            .into_iter()
            .map(|mut rx| {
                Box::pin(async move {
                    loop {
                        if *rx.borrow() {
                            return;
                        }
                        if rx.changed().await.is_err() {
                            // Sender dropped without cancelling; this source
                            // can never fire.
                            std::future::pending::<()>().await;
                        }
                    }
                })
            })
            .collect();
        futures_util::future::select_all(waits).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
