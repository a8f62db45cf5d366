//! Decode device admission: how many sessions may run the model at once.

use crate::errors::StreamError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds concurrent decode sessions. With one slot, sessions are serialized.
///
/// Requests that find no free slot are refused rather than queued.
#[derive(Clone)]
pub struct DeviceGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl DeviceGate {
    pub fn new(max_sessions: usize) -> Self {
        let capacity = max_sessions.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Claim a slot for the lifetime of a session.
    pub fn try_acquire(&self) -> Result<DevicePermit, StreamError> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .map(|permit| DevicePermit { _permit: permit })
            .map_err(|_| StreamError::Busy)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Held by the generation worker; the slot frees when it is dropped.
pub struct DevicePermit {
    _permit: OwnedSemaphorePermit,
}
