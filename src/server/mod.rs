//! HTTP surface: submission, polling, burst processing and health.

pub mod routes;

use std::future::Future;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::JoblineError;
use crate::executor::StageExecutor;
use crate::service::JobService;
use crate::supervisor::JobProcessor;

/// Handles shared by every request.
pub struct AppState<E> {
    pub service: JobService,
    pub processor: JobProcessor<E>,
}

impl<E> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            processor: self.processor.clone(),
        }
    }
}

pub fn router<E: StageExecutor>(state: AppState<E>) -> Router {
    Router::new()
        .route("/health", get(routes::health::<E>))
        .route("/jobs", post(routes::submit_job::<E>))
        .route("/jobs/:id", get(routes::job_status::<E>))
        .route("/process", post(routes::process_queue::<E>))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves, then finish in-flight requests.
pub async fn serve<E: StageExecutor>(
    config: &ServerConfig,
    state: AppState<E>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), JoblineError> {
    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("http server stopped");
    Ok(())
}
