use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Global bound on concurrently running mirror refreshes.
///
/// Claiming never waits: a loop that finds the budget exhausted backs off and
/// tries again later.  A claimed token returns to the budget when dropped, so
/// the available count stays within `0..=max` on every path, including
/// panics and cancellation.
#[derive(Debug, Clone)]
pub struct ConcurrencyBudget {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl ConcurrencyBudget {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Take one token if any is available.
    pub fn try_claim(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
