//! In-process job queue.
//!
//! A memory-backed FIFO shared by submitters and workers. Delivery is
//! at-most-once and best-effort: whatever is still buffered when the process
//! dies is gone, and a job whose worker dies mid-run is never redelivered.
//!
//! Shutdown signals are pushed to the *front* of the buffer, one per worker,
//! so a worker stops right after its current run while un-started jobs stay
//! queued.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::JobPayload;
use crate::store::JobStore;

/// A job waiting for a worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub payload: JobPayload,
    pub enqueued_at: DateTime<Utc>,
}

/// What a worker gets back from [`JobQueue::dequeue`].
#[derive(Debug)]
pub enum Dequeued {
    Job(QueuedJob),
    /// Exit the worker loop; do not put it back.
    Shutdown,
}

pub struct JobQueue {
    items: Mutex<VecDeque<Dequeued>>,
    available: Notify,
    store: Arc<JobStore>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("pending", &self.len())
            .field("jobs", &self.store.len())
            .finish()
    }
}

impl JobQueue {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            store,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Register the job as queued and hand it to the workers.
    ///
    /// The store entry exists before the job becomes visible to any worker,
    /// so a poll right after submission never reports "not found".
    pub fn enqueue(&self, payload: JobPayload) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.store.create(id)?;
        self.items.lock().push_back(Dequeued::Job(QueuedJob {
            id,
            payload,
            enqueued_at: Utc::now(),
        }));
        self.available.notify_one();
        info!(job_id = %id, pending = self.len(), "job queued");
        Ok(id)
    }

    /// Wait for the next item.
    pub async fn dequeue(&self) -> Dequeued {
        loop {
            let notified = self.available.notified();
            let next = self.items.lock().pop_front();
            if let Some(item) = next {
                return item;
            }
            notified.await;
        }
    }

    /// Take the next job without waiting. Shutdown signals are left in place
    /// for the workers they are meant for.
    pub fn try_dequeue_job(&self) -> Option<QueuedJob> {
        let mut items = self.items.lock();
        match items.front() {
            Some(Dequeued::Job(_)) => match items.pop_front() {
                Some(Dequeued::Job(job)) => Some(job),
                _ => None,
            },
            _ => None,
        }
    }

    /// Put one shutdown signal per worker ahead of all pending jobs.
    pub fn signal_shutdown(&self, workers: usize) {
        {
            let mut items = self.items.lock();
            for _ in 0..workers {
                items.push_front(Dequeued::Shutdown);
            }
        }
        for _ in 0..workers {
            self.available.notify_one();
        }
        debug!(workers, "shutdown signals queued");
    }

    /// Jobs waiting for a worker. Shutdown signals are not counted.
    pub fn len(&self) -> usize {
        self.items
            .lock()
            .iter()
            .filter(|item| matches!(item, Dequeued::Job(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
