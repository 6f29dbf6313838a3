mod cli;
mod ui;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use jobline::anthropic::AnthropicClient;
use jobline::config::JoblineConfig;
use jobline::executor::{ScriptedExecutor, StageExecutor};
use jobline::job::{JobPayload, JobSnapshot, JobStatus};
use jobline::pipeline::PipelineRunner;
use jobline::queue::JobQueue;
use jobline::server::{self, AppState};
use jobline::service::JobService;
use jobline::stage::default_stages;
use jobline::store::JobStore;
use jobline::supervisor::{JobProcessor, WorkerSupervisor};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) if !path.exists() => bail!("config file {} does not exist", path.display()),
        Some(path) => JoblineConfig::load_from(path),
        None => JoblineConfig::load(),
    }
    .context("failed to load configuration")?;
    if let Some(workers) = cli.workers {
        config.workers = Some(workers);
    }
    if let Some(capacity) = cli.gate_capacity {
        config.gate_capacity = capacity;
    }
    if let Command::Serve { host, port } = &cli.command {
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
    }
    config.validate()?;

    match cli.command {
        Command::Serve { .. } => {
            if config.api_key.is_empty() {
                warn!("ANTHROPIC_API_KEY is not set, stages will get scripted replies");
                serve(&config, Arc::new(ScriptedExecutor::demo())).await
            } else {
                serve(&config, Arc::new(anthropic_client(&config)?)).await
            }
        }
        Command::Run { payload } => {
            let payload = read_payload(&payload)?;
            let snapshot = if config.api_key.is_empty() {
                warn!("ANTHROPIC_API_KEY is not set, stages will get scripted replies");
                run_once(&config, Arc::new(ScriptedExecutor::demo()), payload).await?
            } else {
                run_once(&config, Arc::new(anthropic_client(&config)?), payload).await?
            };
            if snapshot.status == JobStatus::Failed {
                bail!("job failed");
            }
            Ok(())
        }
        Command::Demo => {
            config.stages = default_stages();
            let payload = JobPayload::default()
                .with_text(
                    "cv",
                    "Jane Doe. QA automation engineer, 6 years. Rust, SQL, Playwright, \
                     GitHub Actions. Built the regression suite for a payments platform.",
                )
                .with_text(
                    "requirements",
                    "Middle AQA: automation frameworks, CI pipelines, API testing, ownership.",
                );
            run_once(&config, Arc::new(ScriptedExecutor::demo()), payload).await?;
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "jobline=debug,tower_http=debug"
    } else {
        "jobline=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn anthropic_client(config: &JoblineConfig) -> Result<AnthropicClient> {
    Ok(AnthropicClient::new(
        config.api_key.clone(),
        config.model.clone(),
        config.max_tokens,
    )?)
}

fn read_payload(path: &Path) -> Result<JobPayload> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read payload file {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a valid payload", path.display()))
}

/// Wire queue, store, runner and processor together.
fn build<E: StageExecutor>(
    config: &JoblineConfig,
    executor: Arc<E>,
) -> Result<(JobService, JobProcessor<E>)> {
    let runner = Arc::new(PipelineRunner::from_config(config, executor)?);
    let stage_names = runner.stage_names().map(str::to_string).collect();
    let queue = Arc::new(JobQueue::new(Arc::new(JobStore::new())));
    let processor = JobProcessor::new(Arc::clone(&queue), runner);
    let service = JobService::new(queue, config.max_input_bytes, stage_names);
    Ok((service, processor))
}

async fn serve<E: StageExecutor>(config: &JoblineConfig, executor: Arc<E>) -> Result<()> {
    let (service, processor) = build(config, executor)?;
    let mut pool = WorkerSupervisor::new(processor.clone());
    pool.start(config.pool_size());

    let state = AppState { service, processor };
    let served = server::serve(&config.server, state, shutdown_signal()).await;

    let report = pool.shutdown(config.shutdown_timeout()).await;
    if report.forced > 0 {
        warn!(forced = report.forced, "in-flight jobs were lost during shutdown");
    }
    served?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("ctrl-c received, shutting down"),
        Err(err) => error!(error = %err, "cannot listen for ctrl-c, shutting down"),
    }
}

/// Submit one payload to a single-worker pool and wait for the outcome.
async fn run_once<E: StageExecutor>(
    config: &JoblineConfig,
    executor: Arc<E>,
    payload: JobPayload,
) -> Result<JobSnapshot> {
    let (service, processor) = build(config, executor)?;
    let id = service.submit(payload)?;

    let progress = ui::RunProgress::start(id);
    let mut pool = WorkerSupervisor::new(processor);
    pool.start(1);

    let snapshot = loop {
        let snapshot = service.status(id)?;
        progress.update(id, snapshot.status);
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };
    progress.finish(id, &snapshot);

    pool.shutdown(config.shutdown_timeout()).await;
    Ok(snapshot)
}
