//! Admission control for generation requests
//!
//! A fixed number of generations may run at once; a bounded number of
//! further requests wait for a slot. Anything beyond that is turned away.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Server busy: generation queue is full")]
    QueueFull,

    #[error("Server is shutting down")]
    Closed,
}

/// Shared gate in front of the model
#[derive(Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    max_queue: usize,
}

/// Decrements the waiting count however the wait ends
struct WaitingSlot(Arc<AtomicUsize>);

impl Drop for WaitingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionGate {
    pub fn new(concurrency: usize, max_queue: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_queue,
        }
    }

    /// Wait for a generation slot
    ///
    /// The returned permit must be held until the response is fully sent.
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit, AdmissionError> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _slot = WaitingSlot(self.waiting.clone());
        if queued >= self.max_queue {
            tracing::warn!("Rejecting request: {} already waiting", queued);
            return Err(AdmissionError::QueueFull);
        }

        tracing::debug!("Request queued behind {} others", queued);
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)
    }
}
