//! The worker pool that drains the job queue.
//!
//! Every worker loops: dequeue, mark the job processing, run the pipeline,
//! record the terminal status. [`JobProcessor`] is
//! that loop body, shared by the pool and by burst draining through
//! `POST /process`.
//!
//! Shutdown puts one signal per worker at the head of the queue, so each
//! worker stops after its current run and jobs nobody started stay queued.
//! Workers still busy when the shutdown deadline passes are aborted; their
//! job is lost and stays `processing`. Crashed workers are not restarted.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, PipelineError};
use crate::executor::StageExecutor;
use crate::job::Transition;
use crate::pipeline::PipelineRunner;
use crate::queue::{Dequeued, JobQueue, QueuedJob};

/// Runs single jobs against the shared queue, store and runner.
pub struct JobProcessor<E> {
    queue: Arc<JobQueue>,
    runner: Arc<PipelineRunner<E>>,
}

impl<E> Clone for JobProcessor<E> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            runner: Arc::clone(&self.runner),
        }
    }
}

impl<E: StageExecutor> JobProcessor<E> {
    pub fn new(queue: Arc<JobQueue>, runner: Arc<PipelineRunner<E>>) -> Self {
        Self { queue, runner }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Take one dequeued job to a terminal status.
    pub async fn process(&self, job: QueuedJob) {
        let store = self.queue.store();
        if let Err(err) = store.transition(job.id, Transition::Start) {
            error!(job_id = %job.id, error = %err, "job could not be started");
            return;
        }
        debug!(
            job_id = %job.id,
            waited_ms = (chrono::Utc::now() - job.enqueued_at).num_milliseconds(),
            "job started"
        );

        let run = AssertUnwindSafe(self.runner.run(job.id, &job.payload)).catch_unwind();
        let result = match run.await {
            Ok(result) => result,
            Err(panic) => {
                error!(job_id = %job.id, panic = %panic_message(&*panic), "pipeline run panicked");
                Err(PipelineError::Internal("pipeline run panicked".into()))
            }
        };

        let transition = match result {
            Ok(outcome) => Transition::Complete(outcome.value),
            Err(err) => {
                if err.kind() == ErrorKind::Internal {
                    error!(job_id = %job.id, error = %err, "job failed");
                } else {
                    warn!(job_id = %job.id, kind = %err.kind(), error = %err, "job failed");
                }
                Transition::Fail {
                    kind: err.kind(),
                    message: err.public_message(),
                }
            }
        };

        match store.transition(job.id, transition) {
            Ok(status) => {
                let duration_ms = store.record(job.id).and_then(|r| r.duration_ms());
                info!(job_id = %job.id, %status, ?duration_ms, "job finished");
            }
            Err(err) => error!(job_id = %job.id, error = %err, "job result could not be recorded"),
        }
    }

    /// Process queued jobs on the calling task until none are left.
    /// Returns whether anything was processed.
    pub async fn drain(&self) -> bool {
        let mut processed = 0usize;
        while let Some(job) = self.queue.try_dequeue_job() {
            self.process(job).await;
            processed += 1;
        }
        if processed > 0 {
            info!(processed, "queue drained");
        }
        processed > 0
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
pub struct WorkerRecord {
    pub id: usize,
    handle: JoinHandle<()>,
    state: Arc<Mutex<WorkerState>>,
}

impl WorkerRecord {
    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }
}

/// How the workers ended during [`WorkerSupervisor::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Stopped on their own after finishing their current job.
    pub graceful: usize,
    /// Aborted at the deadline.
    pub forced: usize,
    /// Had already died from a panic outside job processing.
    pub crashed: usize,
}

pub struct WorkerSupervisor<E> {
    processor: JobProcessor<E>,
    workers: Vec<WorkerRecord>,
    signalled: AtomicBool,
}

impl<E: StageExecutor> WorkerSupervisor<E> {
    pub fn new(processor: JobProcessor<E>) -> Self {
        Self {
            processor,
            workers: Vec::new(),
            signalled: AtomicBool::new(false),
        }
    }

    /// Spawn `size` workers. Must be called from within a tokio runtime.
    pub fn start(&mut self, size: usize) {
        for id in 0..size {
            let state = Arc::new(Mutex::new(WorkerState::Starting));
            let handle = tokio::spawn(worker_loop(id, self.processor.clone(), Arc::clone(&state)));
            self.workers.push(WorkerRecord { id, handle, state });
        }
        info!(workers = size, "worker pool started");
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(WorkerRecord::state).collect()
    }

    /// Ask every worker to stop after its current job. Idempotent.
    pub fn signal_shutdown(&self) {
        if self.signalled.swap(true, Ordering::SeqCst) {
            return;
        }
        for worker in &self.workers {
            let mut state = worker.state.lock();
            if *state != WorkerState::Stopped {
                *state = WorkerState::Stopping;
            }
        }
        self.processor.queue().signal_shutdown(self.workers.len());
        info!(workers = self.workers.len(), "shutdown signalled");
    }

    /// Stop the pool, waiting at most `limit` for in-flight jobs.
    pub async fn shutdown(&mut self, limit: Duration) -> ShutdownReport {
        self.signal_shutdown();
        let deadline = Instant::now() + limit;
        let mut report = ShutdownReport::default();

        for WorkerRecord {
            id,
            mut handle,
            state,
        } in self.workers.drain(..)
        {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => report.graceful += 1,
                Ok(Err(err)) => {
                    error!(worker = id, error = %err, "worker had crashed");
                    report.crashed += 1;
                }
                Err(_) => {
                    handle.abort();
                    *state.lock() = WorkerState::Stopped;
                    error!(worker = id, "worker did not stop before the deadline, aborted");
                    report.forced += 1;
                }
            }
        }

        info!(
            graceful = report.graceful,
            forced = report.forced,
            crashed = report.crashed,
            pending = self.processor.queue().len(),
            "worker pool stopped"
        );
        report
    }
}

async fn worker_loop<E: StageExecutor>(
    id: usize,
    processor: JobProcessor<E>,
    state: Arc<Mutex<WorkerState>>,
) {
    {
        let mut state = state.lock();
        if *state == WorkerState::Starting {
            *state = WorkerState::Running;
        }
    }
    debug!(worker = id, "worker running");

    loop {
        match processor.queue().dequeue().await {
            Dequeued::Shutdown => break,
            Dequeued::Job(job) => processor.process(job).await,
        }
    }

    *state.lock() = WorkerState::Stopped;
    debug!(worker = id, "worker stopped");
}
