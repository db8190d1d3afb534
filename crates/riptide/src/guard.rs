use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::BridgeError;

/// Non-reentrant per-session lock serializing remote-triggered backend calls and
/// synchronous evaluations issued by backend code. Never waits: a held guard is
/// reported as [`BridgeError::Reentrancy`].
#[derive(Clone)]
pub struct ConcurrencyGuard {
    permits: Arc<Semaphore>,
}

/// Proof of holding the guard; released on drop.
pub struct GuardPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn try_acquire(&self, purpose: &str) -> Result<GuardPermit, BridgeError> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .map(|permit| GuardPermit { _permit: permit })
            .map_err(|_| BridgeError::Reentrancy(purpose.to_string()))
    }

    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

impl Default for ConcurrencyGuard {
    fn default() -> Self {
        Self::new()
    }
}
