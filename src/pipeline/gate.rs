//! Bounded-concurrency admission gate.
//!
//! A counting semaphore of fixed capacity decides when a pipeline run may
//! start. Waiters are served in arrival order (tokio's semaphore queue is
//! FIFO), and the permit is released on drop on every exit path.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::cancel::CancelFlag;

/// Errors from permit acquisition.
#[derive(Debug, Error)]
pub enum GateError {
    /// The waiter's task was cancelled before a slot freed.
    #[error("cancelled while waiting for an admission slot")]
    Cancelled,

    /// The gate was shut down.
    #[error("admission gate closed")]
    Closed,
}

/// A granted admission slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

/// Concurrency limiter bounding simultaneous pipeline runs.
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    /// Create a gate with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a slot, bailing out if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancelFlag) -> Result<Permit, GateError> {
        tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                let permit = permit.map_err(|_| GateError::Closed)?;
                Ok(Permit { _permit: permit })
            }
            _ = cancel.cancelled() => Err(GateError::Cancelled),
        }
    }

    /// Stop admitting new runs. Waiters get [`GateError::Closed`]; permits
    /// already granted stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
