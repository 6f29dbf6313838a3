//! The text-generation primitive behind every stage.
//!
//! [`StageExecutor`] is the seam between the pipeline engine and the model
//! provider. [`AnthropicClient`](crate::anthropic::AnthropicClient) is the
//! production implementation; [`ScriptedExecutor`] answers from canned
//! replies and drives the `demo` command and offline runs.

use std::collections::HashMap;
use std::future::Future;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PipelineError;
use crate::stage::StageInput;

/// Resource consumption of one or more executor calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u32,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, delta: Usage) {
        self.input_tokens += delta.input_tokens;
        self.output_tokens += delta.output_tokens;
        self.calls += delta.calls;
    }
}

/// Raw text produced by one stage plus what it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReply {
    pub text: String,
    pub usage: Usage,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The service is shedding load (rate limit, overload).
    #[error("downstream overloaded: {0}")]
    Overloaded(String),

    /// The service could not be reached or failed on its side.
    #[error("downstream unreachable: {0}")]
    Unavailable(String),

    /// The request itself was refused; retrying will not help.
    #[error("stage executor failed: {0}")]
    Failed(String),
}

impl From<ExecutorError> for PipelineError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Overloaded(_) | ExecutorError::Unavailable(_) => {
                PipelineError::TransientExternal(err.to_string())
            }
            ExecutorError::Failed(_) => PipelineError::Internal(err.to_string()),
        }
    }
}

/// Runs one stage: input in, raw text and usage out.
pub trait StageExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        input: &StageInput,
    ) -> impl Future<Output = Result<StageReply, ExecutorError>> + Send;
}

/// Answers each stage with a fixed reply, keyed by stage name.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    replies: HashMap<String, String>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(mut self, stage: impl Into<String>, reply: impl Into<String>) -> Self {
        self.replies.insert(stage.into(), reply.into());
        self
    }

    /// Replies for the built-in pipeline, shaped the way real models answer:
    /// fenced, surrounded by prose, or bare.
    pub fn demo() -> Self {
        Self::new()
            .with_reply(
                "extract",
                "```json\n{\"candidate_info\": {\"first_name\": \"Jane\", \"last_name\": \"Doe\", \
                 \"skills\": [\"Rust\", \"SQL\", \"test automation\"], \
                 \"experience\": \"6 years in QA automation\"}}\n```",
            )
            .with_reply(
                "assess",
                "Here is the merged profile: {\"candidate_info\": {\"first_name\": \"Jane\", \
                 \"last_name\": \"Doe\"}, \"assessment\": {\"grade\": \"Middle\", \"type\": \"AQA\", \
                 \"criteria_matching\": [\"automation frameworks\", \"CI pipelines\"], \
                 \"values_assessment\": \"Strong ownership and eagerness to grow.\"}} Hope this helps!",
            )
            .with_reply(
                "plan",
                "{\"message\": \"Interview plan for Jane Doe created successfully.\", \
                 \"key_topics\": [\"Test architecture\", \"CI integration\"], \
                 \"suggested_questions\": [{\"category\": \"Technical\", \"questions\": \
                 [\"How do you keep end-to-end suites fast?\"]}, {\"category\": \"Behavioral\", \
                 \"questions\": [\"Tell us about a release you blocked.\"]}]}",
            )
    }
}

impl StageExecutor for ScriptedExecutor {
    async fn execute(&self, input: &StageInput) -> Result<StageReply, ExecutorError> {
        let text = self.replies.get(&input.stage).cloned().ok_or_else(|| {
            ExecutorError::Failed(format!("no scripted reply for stage '{}'", input.stage))
        })?;
        let usage = Usage {
            input_tokens: input.prompt.split_whitespace().count() as u64,
            output_tokens: text.split_whitespace().count() as u64,
            calls: 1,
        };
        Ok(StageReply { text, usage })
    }
}
