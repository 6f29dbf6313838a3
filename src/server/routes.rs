use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::AppState;
use crate::error::{ErrorKind, JoblineError, PipelineError};
use crate::executor::StageExecutor;
use crate::job::{JobPayload, JobSnapshot};
use crate::store::StatusCounts;

/// Error body: `{error, code}`.
#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    App(JoblineError),
    /// A path id that is not a job id at all.
    MalformedId(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Pipeline(err)
    }
}

impl From<JoblineError> for ApiError {
    fn from(err: JoblineError) -> Self {
        ApiError::App(err)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Pipeline(err) => match err.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::TransientExternal => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::App(JoblineError::JobNotFound(_)) | ApiError::MalformedId(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::App(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> String {
        match self {
            ApiError::Pipeline(err) => err.kind().to_string(),
            ApiError::App(JoblineError::JobNotFound(_)) | ApiError::MalformedId(_) => {
                "not_found".into()
            }
            ApiError::App(_) => "internal".into(),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Pipeline(err) => err.public_message(),
            ApiError::App(err @ JoblineError::JobNotFound(_)) => err.to_string(),
            ApiError::App(_) => "internal error".into(),
            ApiError::MalformedId(id) => format!("Job not found: {id}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code().is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }
        let body = json!({ "error": self.message(), "code": self.code() });
        (self.status_code(), Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub jobs: StatusCounts,
    pub pending: usize,
}

/// GET /health
pub async fn health<E: StageExecutor>(State(state): State<AppState<E>>) -> Json<HealthResponse> {
    let queue = state.processor.queue();
    Json(HealthResponse {
        status: "ok",
        jobs: queue.store().counts(),
        pending: queue.len(),
    })
}

/// POST /jobs
pub async fn submit_job<E: StageExecutor>(
    State(state): State<AppState<E>>,
    Json(payload): Json<JobPayload>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let job_id = state.service.submit(payload)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// GET /jobs/:id
pub async fn job_status<E: StageExecutor>(
    State(state): State<AppState<E>>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::MalformedId(id))?;
    Ok(Json(state.service.status(id)?))
}

/// POST /process: run every queued job on this request, for deployments
/// where an external trigger replaces the resident pool.
pub async fn process_queue<E: StageExecutor>(State(state): State<AppState<E>>) -> Json<Value> {
    let processed = state.processor.drain().await;
    Json(json!({ "processed": processed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JoblineConfig;
    use crate::executor::ScriptedExecutor;
    use crate::pipeline::PipelineRunner;
    use crate::queue::JobQueue;
    use crate::server::router;
    use crate::service::JobService;
    use crate::store::JobStore;
    use crate::supervisor::JobProcessor;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = JoblineConfig::default();
        let runner = PipelineRunner::from_config(&config, Arc::new(ScriptedExecutor::demo())).unwrap();
        let stage_names = runner.stage_names().map(str::to_string).collect();
        let queue = Arc::new(JobQueue::new(Arc::new(JobStore::new())));
        router(AppState {
            service: JobService::new(Arc::clone(&queue), 1024, stage_names),
            processor: JobProcessor::new(queue, Arc::new(runner)),
        })
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn submit_poll_process_poll() {
        let app = app();
        let (status, body) = send(
            &app,
            post_json("/jobs", json!({"texts": {"cv": "Jane Doe", "requirements": "CI"}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["job_id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, get(&format!("/jobs/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "queued"}));

        let (_, body) = send(&app, post_json("/process", json!({}))).await;
        assert_eq!(body, json!({"processed": true}));

        let (status, body) = send(&app, get(&format!("/jobs/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert!(body["result"]["suggested_questions"].is_array());
        assert!(body.get("error").is_none());

        let (_, body) = send(&app, post_json("/process", json!({}))).await;
        assert_eq!(body, json!({"processed": false}));
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_with_400() {
        let app = app();
        let (status, body) = send(&app, post_json("/jobs", json!({"texts": {}}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation");
        assert!(body["error"].as_str().unwrap().contains("at least one"));

        let (_, health) = send(&app, get("/health")).await;
        assert_eq!(health["jobs"]["queued"], 0);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let app = app();
        let (status, body) = send(&app, get(&format!("/jobs/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn malformed_job_id_is_404_with_error_body() {
        let app = app();
        let (status, body) = send(&app, get("/jobs/not-a-uuid")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body,
            json!({"error": "Job not found: not-a-uuid", "code": "not_found"})
        );
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let app = app();
        send(&app, post_json("/jobs", json!({"texts": {"cv": "Jane"}}))).await;
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["jobs"]["queued"], 1);
        assert_eq!(body["pending"], 1);
    }
}
