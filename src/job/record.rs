use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::status::{JobStatus, Transition};
use crate::error::{ErrorKind, StoreError};

/// The status record of one submitted job, as kept by the job store.
///
/// Serializes to the persisted entry shape: `status`, `result` and `error`
/// are always present (`null` when unset), followed by the bookkeeping fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            result: None,
            error: None,
            error_kind: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Apply a transition in place. Rejected transitions leave the record
    /// exactly as it was.
    pub fn apply(&mut self, transition: Transition) -> Result<(), StoreError> {
        let next = transition.target();
        if !self.status.can_advance_to(next) {
            return Err(StoreError::IllegalTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match transition {
            Transition::Start => self.started_at = Some(now),
            Transition::Complete(result) => {
                self.result = Some(result);
                self.finished_at = Some(now);
            }
            Transition::Fail { kind, message } => {
                self.error = Some(message);
                self.error_kind = Some(kind);
                self.finished_at = Some(now);
            }
        }
        self.status = next;
        Ok(())
    }

    /// Wall-clock time spent processing, once the job is terminal.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// What a poller sees. `result` only appears for completed jobs and `error`
/// only for failed ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
