//! Single-resolution completion shared by any number of waiters.

use std::sync::Arc;

use tokio::sync::watch;

use crate::protocol::ResError;

type Outcome = Option<Result<(), ResError>>;

/// Completes exactly once. Every clone observes the same outcome.
#[derive(Clone)]
pub struct Pending {
    tx: Arc<watch::Sender<Outcome>>,
}

impl Default for Pending {
    fn default() -> Self {
        Self::new()
    }
}

impl Pending {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Resolve with `outcome`. Returns `false` if already resolved,
    /// in which case the first outcome is kept.
    pub fn resolve(&self, outcome: Result<(), ResError>) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The outcome, if resolved.
    pub fn outcome(&self) -> Option<Result<(), ResError>> {
        self.tx.borrow().clone()
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> Result<(), ResError> {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ResError::connection_closed())?;
        outcome.clone().unwrap_or_else(|| Err(ResError::internal("pending outcome missing")))
    }
}
