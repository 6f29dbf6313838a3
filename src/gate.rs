//! Admission control for pipeline runs.
//!
//! The stage executor talks to a rate-limited service. [`ConcurrencyGate`]
//! bounds how many runs of this process may talk to it at once; with the
//! default capacity of 1 runs are fully serialized. The gate is process
//! local, so every worker of the process must share the same instance.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::PipelineError;

#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the duration of one run. Dropping it frees the slot, whichever
/// way the run ends.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    /// A capacity of zero would block forever and is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait (without spinning) until a slot is free.
    pub async fn acquire(&self) -> Result<GatePermit, PipelineError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Internal("concurrency gate closed".into()))?;
        Ok(GatePermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
