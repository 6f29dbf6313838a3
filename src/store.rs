//! Job status store.
//!
//! [`JobStore`] maps job ids to their [`JobRecord`]. All writes go through
//! [`DashMap`] entry guards, so each transition is applied under the write
//! lock of the job's shard: concurrent writers for the same id are
//! serialized, and a reader never sees a half-applied transition.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{JobRecord, JobSnapshot, JobStatus, Transition};

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct JobStore {
    jobs: DashMap<Uuid, JobRecord>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job as queued.
    pub fn create(&self, id: Uuid) -> Result<(), StoreError> {
        match self.jobs.entry(id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(id)),
            Entry::Vacant(slot) => {
                slot.insert(JobRecord::new(id));
                Ok(())
            }
        }
    }

    /// Atomically advance a job. Returns the new status.
    pub fn transition(&self, id: Uuid, transition: Transition) -> Result<JobStatus, StoreError> {
        let mut record = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.apply(transition)?;
        Ok(record.status)
    }

    pub fn read(&self, id: Uuid) -> Option<JobSnapshot> {
        self.jobs.get(&id).map(|record| record.snapshot())
    }

    pub fn record(&self, id: Uuid) -> Option<JobRecord> {
        self.jobs.get(&id).map(|record| record.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.jobs.iter() {
            match record.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}
