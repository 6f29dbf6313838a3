//! Submission and status lookup, shared by the HTTP API and the CLI.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::{JoblineError, PipelineError};
use crate::job::{JobPayload, JobSnapshot};
use crate::queue::JobQueue;

#[derive(Debug, Clone)]
pub struct JobService {
    queue: Arc<JobQueue>,
    max_input_bytes: usize,
    stage_names: Vec<String>,
}

impl JobService {
    pub fn new(queue: Arc<JobQueue>, max_input_bytes: usize, stage_names: Vec<String>) -> Self {
        Self {
            queue,
            max_input_bytes,
            stage_names,
        }
    }

    /// Validate and enqueue a payload. Rejected payloads never reach the
    /// queue or the store.
    pub fn submit(&self, payload: JobPayload) -> Result<Uuid, PipelineError> {
        payload.validate(self.max_input_bytes, &self.stage_names)?;
        self.queue
            .enqueue(payload)
            .map_err(|e| PipelineError::Internal(e.to_string()))
    }

    pub fn status(&self, id: Uuid) -> Result<JobSnapshot, JoblineError> {
        let snapshot = self.queue.store().read(id).ok_or(JoblineError::JobNotFound(id))?;
        debug!(job_id = %id, status = %snapshot.status, "status read");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::job::JobStatus;
    use crate::store::JobStore;

    fn service(max_input_bytes: usize) -> JobService {
        JobService::new(
            Arc::new(JobQueue::new(Arc::new(JobStore::new()))),
            max_input_bytes,
            vec!["extract".into(), "plan".into()],
        )
    }

    #[test]
    fn submitted_job_is_immediately_queued() {
        let service = service(1024);
        let id = service
            .submit(JobPayload::default().with_text("cv", "Jane"))
            .unwrap();
        let snapshot = service.status(id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert!(snapshot.result.is_none() && snapshot.error.is_none());
    }

    #[test]
    fn invalid_payload_is_never_enqueued() {
        let service = service(4);
        let err = service
            .submit(JobPayload::default().with_text("cv", "far too long"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(service.queue.is_empty());
        assert!(service.queue.store().is_empty());
    }

    #[test]
    fn block_shadowing_a_stage_is_never_enqueued() {
        let service = service(1024);
        let err = service
            .submit(JobPayload::default().with_text("extract", "Jane"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(service.queue.store().is_empty());
    }

    #[test]
    fn unknown_job_is_not_found() {
        let id = Uuid::new_v4();
        assert!(matches!(
            service(1024).status(id),
            Err(JoblineError::JobNotFound(missing)) if missing == id
        ));
    }
}
