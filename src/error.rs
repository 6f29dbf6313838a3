use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::anthropic::AnthropicError;
use crate::job::JobStatus;

#[derive(Debug, Error)]
pub enum JoblineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Rejections from the job store. The entry is left untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("job {0} does not exist")]
    NotFound(Uuid),

    #[error("job {0} already exists")]
    Duplicate(Uuid),

    #[error("job {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Classifies a job failure. Stored next to the short error message of a
/// failed job so operators can tell overload from bad model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed submission or unresolvable reference.
    Validation,
    /// Downstream overload or network failure.
    TransientExternal,
    /// A stage's output could not be reduced to the expected structure.
    StageParse,
    /// A stage or job deadline expired.
    Timeout,
    /// Unexpected defect.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::TransientExternal => write!(f, "transient_external"),
            ErrorKind::StageParse => write!(f, "stage_parse"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Everything that can abort a pipeline run or reject a submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("invalid submission: {0}")]
    Validation(String),

    #[error("downstream service unavailable, retry later: {0}")]
    TransientExternal(String),

    #[error("stage '{stage}' output could not be parsed ({reason}): {excerpt}")]
    StageParse {
        stage: String,
        reason: String,
        excerpt: String,
    },

    #[error("{scope} exceeded its {limit:?} deadline")]
    Timeout { scope: String, limit: Duration },

    #[error("internal error: {0}")]
    Internal(String),
}

const INTERNAL_PUBLIC_MESSAGE: &str = "internal error while processing the job";

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::TransientExternal(_) => ErrorKind::TransientExternal,
            PipelineError::StageParse { .. } => ErrorKind::StageParse,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The message stored on a failed job and returned to pollers.
    ///
    /// Internal errors never leak their detail; everything else is reduced
    /// to the last line of its diagnostic.
    pub fn public_message(&self) -> String {
        match self {
            PipelineError::Internal(_) => INTERNAL_PUBLIC_MESSAGE.to_string(),
            other => last_line(&other.to_string()),
        }
    }
}

/// Last non-empty line of a diagnostic, trimmed.
pub fn last_line(diagnostic: &str) -> String {
    diagnostic
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("unknown error")
        .to_string()
}
