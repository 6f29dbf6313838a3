//! Runs one job's payload through the ordered stage chain.
//!
//! A run resolves the payload into context, takes a slot of the
//! [`ConcurrencyGate`] and then executes every stage in order, folding each
//! parsed output back into the context for the next one. The first failing
//! stage ends the run; partial outputs are dropped with it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::JoblineConfig;
use crate::contract::parse_stage_output;
use crate::error::{JoblineError, PipelineError};
use crate::executor::{StageExecutor, Usage};
use crate::fetch::{HttpFetcher, read_document};
use crate::gate::ConcurrencyGate;
use crate::job::{JobPayload, RESERVED_NAMES, parse_link};
use crate::stage::{RunContext, StageDefinition};

/// Message attached to results whose last stage did not provide one.
const DEFAULT_MESSAGE: &str = "pipeline completed";

#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    /// Deadline of one executor call.
    pub stage_timeout: Duration,
    /// Deadline of the whole stage chain. It starts once the gate admits the
    /// run, so time spent waiting for a slot does not count against it.
    pub job_timeout: Duration,
    pub excerpt_chars: usize,
}

impl RunSettings {
    pub fn from_config(config: &JoblineConfig) -> Self {
        Self {
            stage_timeout: config.stage_timeout(),
            job_timeout: config.job_timeout(),
            excerpt_chars: config.excerpt_chars,
        }
    }
}

/// State of one run in progress. Owned by the worker executing it.
#[derive(Debug)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub context: RunContext,
    /// Raw text of every stage executed so far, in order.
    pub stage_outputs: Vec<(String, String)>,
    pub usage: Usage,
}

impl PipelineRun {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            context: RunContext::new(),
            stage_outputs: Vec::new(),
            usage: Usage::default(),
        }
    }
}

/// The result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub value: Value,
    pub usage: Usage,
}

pub struct PipelineRunner<E> {
    stages: Arc<[StageDefinition]>,
    executor: Arc<E>,
    gate: ConcurrencyGate,
    fetcher: HttpFetcher,
    settings: RunSettings,
}

impl<E> std::fmt::Debug for PipelineRunner<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("stages", &self.stages.len())
            .field("gate_capacity", &self.gate.capacity())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<E: StageExecutor> PipelineRunner<E> {
    pub fn new(
        stages: Vec<StageDefinition>,
        executor: Arc<E>,
        gate: ConcurrencyGate,
        fetcher: HttpFetcher,
        settings: RunSettings,
    ) -> Result<Self, JoblineError> {
        if stages.is_empty() {
            return Err(JoblineError::Config("a pipeline needs at least one stage".into()));
        }
        if let Some(reserved) = stages.iter().find(|s| RESERVED_NAMES.contains(&s.name())) {
            return Err(JoblineError::Config(format!(
                "stage name '{}' is reserved",
                reserved.name()
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = stages.iter().find(|s| !seen.insert(s.name())) {
            return Err(JoblineError::Config(format!(
                "stage '{}' is defined twice",
                dup.name()
            )));
        }
        Ok(Self {
            stages: stages.into(),
            executor,
            gate,
            fetcher,
            settings,
        })
    }

    /// Build the runner described by the configuration, with a fresh gate.
    pub fn from_config(config: &JoblineConfig, executor: Arc<E>) -> Result<Self, JoblineError> {
        let stages = config.stages.iter().map(StageDefinition::from_spec).collect();
        Self::new(
            stages,
            executor,
            ConcurrencyGate::new(config.gate_capacity),
            HttpFetcher::new(config.fetch_timeout(), config.max_input_bytes)?,
            RunSettings::from_config(config),
        )
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(StageDefinition::name)
    }

    /// Execute the whole chain for one job.
    pub async fn run(&self, job_id: Uuid, payload: &JobPayload) -> Result<RunOutcome, PipelineError> {
        let mut run = PipelineRun::new(job_id);
        self.resolve(payload, &mut run.context).await?;

        let _permit = self.gate.acquire().await?;
        info!(
            job_id = %run.run_id,
            stages = self.stages.len(),
            blocks = run.context.len(),
            "pipeline run started"
        );

        let limit = self.settings.job_timeout;
        timeout(limit, self.run_stages(&mut run))
            .await
            .map_err(|_| PipelineError::Timeout {
                scope: "job".into(),
                limit,
            })??;

        let last = run
            .context
            .previous()
            .cloned()
            .ok_or_else(|| PipelineError::Internal("run finished without output".into()))?;
        info!(
            job_id = %run.run_id,
            calls = run.usage.calls,
            input_tokens = run.usage.input_tokens,
            output_tokens = run.usage.output_tokens,
            "pipeline run finished"
        );
        Ok(RunOutcome {
            value: finalize(last),
            usage: run.usage,
        })
    }

    async fn run_stages(&self, run: &mut PipelineRun) -> Result<(), PipelineError> {
        for stage in self.stages.iter() {
            if let Err(err) = self.run_stage(stage, run).await {
                warn!(job_id = %run.run_id, stage = stage.name(), error = %err, "stage failed");
                return Err(err);
            }
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: &StageDefinition,
        run: &mut PipelineRun,
    ) -> Result<(), PipelineError> {
        let input = stage.build_input(&run.context);
        debug!(job_id = %run.run_id, stage = stage.name(), prompt_chars = input.prompt.len(), "stage started");

        let limit = self.settings.stage_timeout;
        let reply = timeout(limit, self.executor.execute(&input))
            .await
            .map_err(|_| PipelineError::Timeout {
                scope: format!("stage '{}'", stage.name()),
                limit,
            })??;
        run.usage += reply.usage;

        let value = parse_stage_output(
            stage.name(),
            stage.output_kind(),
            &reply.text,
            self.settings.excerpt_chars,
        )?;
        run.stage_outputs.push((stage.name().to_string(), reply.text));
        run.context.fold_stage(stage.name(), value);
        Ok(())
    }

    /// Turn the payload into the initial context blocks.
    async fn resolve(&self, payload: &JobPayload, ctx: &mut RunContext) -> Result<(), PipelineError> {
        for (name, text) in &payload.texts {
            ctx.insert(name.clone(), Value::String(text.clone()));
        }
        for (name, link) in &payload.links {
            let url = parse_link(link).map_err(|reason| {
                PipelineError::Validation(format!("link '{name}' is not usable: {reason}"))
            })?;
            let fetched = self.fetcher.fetch(&url).await?;
            let text = read_document(&fetched.bytes, &fetched.filename)?;
            debug!(block = %name, chars = text.len(), "link resolved");
            ctx.insert(name.clone(), Value::String(text));
        }
        Ok(())
    }
}

/// Attach run-level metadata to the last stage's value.
fn finalize(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            map.entry("message")
                .or_insert_with(|| Value::String(DEFAULT_MESSAGE.into()));
            Value::Object(map)
        }
        other => json!({ "message": DEFAULT_MESSAGE, "output": other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::executor::{ExecutorError, ScriptedExecutor, StageReply};
    use crate::stage::{OutputKind, StageInput, default_stages};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Scripted replies plus a log of every input seen.
    struct Recording {
        inner: ScriptedExecutor,
        calls: Mutex<Vec<StageInput>>,
    }

    impl Recording {
        fn new(inner: ScriptedExecutor) -> Self {
            Self {
                inner,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn stages_called(&self) -> Vec<String> {
            self.calls.lock().iter().map(|i| i.stage.clone()).collect()
        }
    }

    impl StageExecutor for Recording {
        async fn execute(&self, input: &StageInput) -> Result<StageReply, ExecutorError> {
            self.calls.lock().push(input.clone());
            self.inner.execute(input).await
        }
    }

    /// Sleeps inside every call and tracks how many calls overlap.
    struct Slow {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Slow {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl StageExecutor for Slow {
        async fn execute(&self, _input: &StageInput) -> Result<StageReply, ExecutorError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(StageReply {
                text: "{\"done\": true}".into(),
                usage: Usage::default(),
            })
        }
    }

    struct Overloaded;

    impl StageExecutor for Overloaded {
        async fn execute(&self, _input: &StageInput) -> Result<StageReply, ExecutorError> {
            Err(ExecutorError::Overloaded("status 529".into()))
        }
    }

    fn settings() -> RunSettings {
        RunSettings {
            stage_timeout: Duration::from_secs(5),
            job_timeout: Duration::from_secs(30),
            excerpt_chars: 40,
        }
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Duration::from_secs(5), 1024).unwrap()
    }

    fn json_stage(name: &str, template: &str) -> StageDefinition {
        StageDefinition::from_template(name, template, OutputKind::default())
    }

    fn runner<E: StageExecutor>(stages: Vec<StageDefinition>, exec: Arc<E>) -> PipelineRunner<E> {
        PipelineRunner::new(stages, exec, ConcurrencyGate::new(1), fetcher(), settings()).unwrap()
    }

    fn three_stages() -> Vec<StageDefinition> {
        vec![
            json_stage("s1", "{{context}}"),
            json_stage("s2", "{{previous}}"),
            json_stage("s3", "{{previous}}"),
        ]
    }

    fn payload() -> JobPayload {
        JobPayload::default().with_text("cv", "Jane Doe, QA engineer")
    }

    #[tokio::test]
    async fn happy_path_returns_last_value() {
        let exec = Arc::new(Recording::new(
            ScriptedExecutor::new()
                .with_reply("s1", "{\"a\": 1}")
                .with_reply("s2", "```json\n{\"b\": 2}\n```")
                .with_reply("s3", "Sure! {\"message\": \"ok\", \"value\": 42}"),
        ));
        let runner = runner(three_stages(), Arc::clone(&exec));

        let outcome = runner.run(Uuid::new_v4(), &payload()).await.unwrap();
        assert_eq!(outcome.value, json!({"message": "ok", "value": 42}));
        assert_eq!(outcome.usage.calls, 3);
        assert_eq!(exec.stages_called(), vec!["s1", "s2", "s3"]);

        let calls = exec.calls.lock();
        assert_eq!(calls[0].prompt, "### cv\nJane Doe, QA engineer");
        assert!(calls[2].prompt.contains("\"b\": 2"));
    }

    #[tokio::test]
    async fn message_is_added_only_when_missing() {
        let exec = Arc::new(ScriptedExecutor::new().with_reply("only", "{\"score\": 7}"));
        let runner = runner(vec![json_stage("only", "x")], exec);
        let outcome = runner.run(Uuid::new_v4(), &payload()).await.unwrap();
        assert_eq!(
            outcome.value,
            json!({"score": 7, "message": DEFAULT_MESSAGE})
        );
    }

    #[tokio::test]
    async fn free_text_final_stage_is_wrapped() {
        let exec = Arc::new(ScriptedExecutor::new().with_reply("summary", "  All good.  "));
        let stage = StageDefinition::from_template("summary", "{{cv}}", OutputKind::FreeText);
        let runner = runner(vec![stage], exec);
        let outcome = runner.run(Uuid::new_v4(), &payload()).await.unwrap();
        assert_eq!(
            outcome.value,
            json!({"message": DEFAULT_MESSAGE, "output": "All good."})
        );
    }

    #[tokio::test]
    async fn mid_chain_parse_failure_stops_the_run() {
        let exec = Arc::new(Recording::new(
            ScriptedExecutor::new()
                .with_reply("s1", "{\"a\": 1}")
                .with_reply("s2", "I could not produce JSON for this one.")
                .with_reply("s3", "{\"c\": 3}"),
        ));
        let runner = runner(three_stages(), Arc::clone(&exec));

        let err = runner.run(Uuid::new_v4(), &payload()).await.unwrap_err();
        match &err {
            PipelineError::StageParse { stage, excerpt, .. } => {
                assert_eq!(stage, "s2");
                assert!(excerpt.starts_with("I could not produce JSON"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(exec.stages_called(), vec!["s1", "s2"]);
        assert_eq!(runner.gate().available(), 1);
    }

    #[tokio::test]
    async fn empty_structured_output_is_a_parse_failure() {
        let exec = Arc::new(ScriptedExecutor::new().with_reply("s1", "   "));
        let runner = runner(vec![json_stage("s1", "x")], exec);
        let err = runner.run(Uuid::new_v4(), &payload()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StageParse);
    }

    #[tokio::test]
    async fn first_stage_sees_no_previous_output() {
        let exec = Arc::new(Recording::new(
            ScriptedExecutor::new().with_reply("s1", "{}"),
        ));
        let runner = runner(vec![json_stage("s1", "[{{previous}}]")], Arc::clone(&exec));
        runner.run(Uuid::new_v4(), &payload()).await.unwrap();
        assert_eq!(exec.calls.lock()[0].prompt, "[]");
    }

    #[tokio::test]
    async fn stage_deadline_fails_with_timeout() {
        let exec = Arc::new(Slow::new(Duration::from_secs(5)));
        let runner = PipelineRunner::new(
            vec![json_stage("slow", "x")],
            exec,
            ConcurrencyGate::new(1),
            fetcher(),
            RunSettings {
                stage_timeout: Duration::from_millis(50),
                ..settings()
            },
        )
        .unwrap();

        let err = runner.run(Uuid::new_v4(), &payload()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("stage 'slow'"));
        assert_eq!(runner.gate().available(), 1);
    }

    #[tokio::test]
    async fn job_deadline_covers_the_stage_chain() {
        let runner = PipelineRunner::new(
            vec![json_stage("a", "x"), json_stage("b", "y")],
            Arc::new(Slow::new(Duration::from_millis(80))),
            ConcurrencyGate::new(1),
            fetcher(),
            RunSettings {
                job_timeout: Duration::from_millis(120),
                ..settings()
            },
        )
        .unwrap();

        let err = runner.run(Uuid::new_v4(), &payload()).await.unwrap_err();
        assert_eq!(
            err,
            PipelineError::Timeout {
                scope: "job".into(),
                limit: Duration::from_millis(120),
            }
        );
        assert_eq!(runner.gate().available(), 1);
    }

    #[tokio::test]
    async fn waiting_for_the_gate_does_not_count_against_the_job_deadline() {
        let gate = ConcurrencyGate::new(1);
        let runner = Arc::new(
            PipelineRunner::new(
                vec![json_stage("a", "x")],
                Arc::new(Slow::new(Duration::from_millis(10))),
                gate.clone(),
                fetcher(),
                RunSettings {
                    job_timeout: Duration::from_millis(100),
                    ..settings()
                },
            )
            .unwrap(),
        );

        let held = gate.acquire().await.unwrap();
        let run = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run(Uuid::new_v4(), &payload()).await })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(held);

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome.value["done"], json!(true));
    }

    #[tokio::test]
    async fn overload_is_transient() {
        let runner = runner(vec![json_stage("s1", "x")], Arc::new(Overloaded));
        let err = runner.run(Uuid::new_v4(), &payload()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientExternal);
    }

    #[tokio::test]
    async fn gate_serializes_concurrent_runs() {
        let exec = Arc::new(Slow::new(Duration::from_millis(20)));
        let runner = Arc::new(runner(
            vec![json_stage("a", "x"), json_stage("b", "y")],
            Arc::clone(&exec),
        ));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let runner = Arc::clone(&runner);
                tokio::spawn(async move { runner.run(Uuid::new_v4(), &payload()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(exec.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn links_are_fetched_into_context() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/requirements.md"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Rust, 5 years"))
            .expect(1)
            .mount(&server)
            .await;

        let exec = Arc::new(Recording::new(
            ScriptedExecutor::new().with_reply("s1", "{}"),
        ));
        let runner = runner(
            vec![json_stage("s1", "{{cv}} vs {{requirements}}")],
            Arc::clone(&exec),
        );
        let payload = payload().with_link("requirements", format!("{}/requirements.md", server.uri()));

        runner.run(Uuid::new_v4(), &payload).await.unwrap();
        assert_eq!(
            exec.calls.lock()[0].prompt,
            "Jane Doe, QA engineer vs Rust, 5 years"
        );
    }

    #[tokio::test]
    async fn unreadable_link_fails_validation_before_any_stage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let exec = Arc::new(Recording::new(ScriptedExecutor::new()));
        let runner = runner(vec![json_stage("s1", "x")], Arc::clone(&exec));
        let payload = payload().with_link("cv2", format!("{}/missing.txt", server.uri()));

        let err = runner.run(Uuid::new_v4(), &payload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(exec.stages_called().is_empty());
    }

    #[tokio::test]
    async fn oversized_link_fails_validation_before_any_stage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 64 * 1024]))
            .mount(&server)
            .await;

        let exec = Arc::new(Recording::new(ScriptedExecutor::new()));
        let runner = runner(vec![json_stage("s1", "x")], Arc::clone(&exec));
        let payload = payload().with_link("dump", format!("{}/dump.txt", server.uri()));

        let err = runner.run(Uuid::new_v4(), &payload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("larger than 1024 bytes"), "{err}");
        assert!(exec.stages_called().is_empty());
    }

    #[tokio::test]
    async fn demo_pipeline_completes_with_scripted_replies() {
        let config = JoblineConfig::default();
        let runner = PipelineRunner::from_config(&config, Arc::new(ScriptedExecutor::demo())).unwrap();
        assert_eq!(
            runner.stage_names().collect::<Vec<_>>(),
            default_stages().iter().map(|s| s.name.as_str()).collect::<Vec<_>>()
        );

        let payload = payload().with_text("requirements", "Automation, CI");
        let outcome = runner.run(Uuid::new_v4(), &payload).await.unwrap();
        assert!(outcome.value["key_topics"].is_array());
        assert!(outcome.value["message"].is_string());
    }

    #[test]
    fn rejects_empty_duplicate_and_reserved_stage_lists() {
        let exec = Arc::new(ScriptedExecutor::new());
        let err = PipelineRunner::new(
            Vec::new(),
            Arc::clone(&exec),
            ConcurrencyGate::new(1),
            fetcher(),
            settings(),
        )
        .unwrap_err();
        assert!(matches!(err, JoblineError::Config(_)));

        let err = PipelineRunner::new(
            vec![json_stage("a", "x"), json_stage("a", "y")],
            Arc::clone(&exec),
            ConcurrencyGate::new(1),
            fetcher(),
            settings(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("'a' is defined twice"));

        let err = PipelineRunner::new(
            vec![json_stage("previous", "x")],
            exec,
            ConcurrencyGate::new(1),
            fetcher(),
            settings(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("'previous' is reserved"));
    }
}
