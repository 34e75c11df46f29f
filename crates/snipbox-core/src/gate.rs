//! Admission control for executions

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Host-wide bound on simultaneous executions
///
/// Slots are semaphore permits. A slot is released when the
/// [`ConcurrencySlot`] holding it is dropped, which happens exactly once on
/// every path out of the coordinator.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    total: usize,
    queue_wait: Duration,
}

/// Returned when no slot frees up within the queue-wait deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateBusy;

impl ConcurrencyGate {
    #[must_use]
    pub fn new(slots: usize, queue_wait: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(slots)),
            total: slots,
            queue_wait,
        }
    }

    /// Wait for a free slot, at most `queue_wait`
    pub async fn acquire(&self) -> Result<ConcurrencySlot, GateBusy> {
        let semaphore = Arc::clone(&self.semaphore);
        match tokio::time::timeout(self.queue_wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(ConcurrencySlot { _permit: permit }),
            // The semaphore is never closed, but treat it like saturation if it is
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(
                    slots = self.total,
                    wait_ms = u64::try_from(self.queue_wait.as_millis()).unwrap_or(u64::MAX),
                    "no execution slot available"
                );
                Err(GateBusy)
            }
        }
    }

    /// Give a slot back; equivalent to dropping it
    pub fn release(&self, slot: ConcurrencySlot) {
        drop(slot);
    }

    /// Get gate status
    #[must_use]
    pub fn status(&self) -> GateStatus {
        let available = self.semaphore.available_permits();
        GateStatus {
            total: self.total,
            available,
            busy: self.total.saturating_sub(available),
        }
    }
}

/// A held execution slot
#[derive(Debug)]
pub struct ConcurrencySlot {
    _permit: OwnedSemaphorePermit,
}

/// Status of the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStatus {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
}
