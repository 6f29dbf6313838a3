use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use super::error::AnthropicError;
use super::types::{Message, MessagesRequest, MessagesResponse};
use crate::executor::{ExecutorError, StageExecutor, StageReply, Usage};
use crate::stage::StageInput;

const API_URL: &str = "https://api.anthropic.com/v1/messages";

/// HTTP status Anthropic uses when it is overloaded.
const OVERLOADED: u16 = 529;

const JSON_SYSTEM_PROMPT: &str =
    "Respond with a single JSON object and nothing else. Do not wrap it in prose.";

pub struct AnthropicClient {
    api_key: String,
    client: Client,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Result<Self, AnthropicError> {
        Self::with_base_url(api_key, model, max_tokens, API_URL.to_string())
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(
        api_key: String,
        model: String,
        max_tokens: u32,
        base_url: String,
    ) -> Result<Self, AnthropicError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url,
            model,
            max_tokens,
        })
    }

    pub async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(AnthropicError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if status.as_u16() == OVERLOADED {
            return Err(AnthropicError::Overloaded);
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AnthropicError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<MessagesResponse>().await?;
        Ok(body)
    }

    fn request_for(&self, input: &StageInput) -> MessagesRequest {
        MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: input.expects_json.then(|| JSON_SYSTEM_PROMPT.to_string()),
            messages: vec![Message {
                role: "user".into(),
                content: input.prompt.clone(),
            }],
        }
    }
}

impl StageExecutor for AnthropicClient {
    async fn execute(&self, input: &StageInput) -> Result<StageReply, ExecutorError> {
        let response = self.send_message(&self.request_for(input)).await?;
        debug!(
            stage = %input.stage,
            model = %response.model,
            stop_reason = ?response.stop_reason,
            "stage reply received"
        );
        Ok(StageReply {
            text: response.text(),
            usage: Usage {
                input_tokens: u64::from(response.usage.input_tokens),
                output_tokens: u64::from(response.usage.output_tokens),
                calls: 1,
            },
        })
    }
}
