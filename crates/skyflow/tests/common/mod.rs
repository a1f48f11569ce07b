// Each integration-test binary compiles its own copy of this module and uses
// a different slice of it.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use skyflow::artifact::ArtifactStore;
use skyflow::config::JobSpec;
use skyflow::context::RuntimeContext;
use skyflow::coordinator::Coordinator;
use skyflow::handler::{Handler, HandlerError, TaskCtx};
use skyflow::ratelimit::RateLimitConfig;
use skyflow::retry::{ErrorKind, RetryConfig};
use skyflow::store::{JobStatus, StateStore, TaskRole, TaskStatus};
use skyflow::worker::WorkerPool;
use skyflow::{ManualClock, MemStateStore};

/// Deterministic runtime: in-memory store, manual clock, scratch artifact
/// root, built-in handlers plus the failure-drill handlers below.
pub struct TestRig {
    pub ctx: RuntimeContext,
    pub clock: Arc<ManualClock>,
    pub tmp: tempfile::TempDir,
}

pub fn rig() -> TestRig {
    rig_with_limits(RateLimitConfig::single("atproto", 1_000_000.0, 1_000_000.0))
}

pub fn rig_with_limits(limits: RateLimitConfig) -> TestRig {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemStateStore::new(clock.clone()));
    let tmp = tempfile::tempdir().expect("tempdir");

    let mut registry = skyflow::handlers::builtin_registry();
    registry.register(Arc::new(FlakyEcho));
    registry.register(Arc::new(AlwaysRetryable));
    registry.register(Arc::new(FailSeqTerminal));
    registry.register(Arc::new(LimitedEcho));
    registry.register(Arc::new(PanicAlways));

    let ctx = RuntimeContext::new(
        store,
        ArtifactStore::new(tmp.path()),
        Arc::new(registry),
        clock.clone(),
        limits,
        RetryConfig::default(),
    );
    TestRig { ctx, clock, tmp }
}

impl TestRig {
    pub fn pool(&self, worker_id: &str) -> WorkerPool {
        WorkerPool::new(
            self.ctx.clone(),
            worker_id,
            30,
            16,
            CancellationToken::new(),
        )
    }

    pub fn coordinator(&self, owner: &str) -> Coordinator {
        Coordinator::new(self.ctx.clone(), owner, 100, CancellationToken::new())
    }

    /// Write an input file under the scratch root, one record per line.
    pub fn write_input(&self, name: &str, lines: &[&str]) -> String {
        let path = self.tmp.path().join(name);
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        std::fs::write(&path, content).expect("write input");
        path.to_string_lossy().into_owned()
    }

    /// Row-chunked spec: batch_size 1 gives one batch per input line.
    pub fn spec(&self, handler_ref: &str, input_path: &str, batch_size: usize) -> JobSpec {
        self.spec_with(handler_ref, input_path, batch_size, serde_json::json!({}))
    }

    /// Same, with handler-specific knobs merged in at the top level.
    pub fn spec_with(
        &self,
        handler_ref: &str,
        input_path: &str,
        batch_size: usize,
        extra: serde_json::Value,
    ) -> JobSpec {
        let mut config = serde_json::json!({
            "name": format!("test-{handler_ref}"),
            "handler_ref": handler_ref,
            "input": { "type": "rows", "path": input_path, "batch_size": batch_size },
        });
        if let (Some(obj), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(config).expect("spec")
    }

    pub async fn submit(&self, spec: JobSpec) -> Uuid {
        Coordinator::submit(&self.ctx, spec, "tests")
            .await
            .expect("submit")
    }

    /// Tick the coordinator and drain the queue until the job goes terminal
    /// (or the iteration budget runs out). Advances the clock past retry
    /// backoff between rounds.
    pub async fn drive(&self, coordinator: &Coordinator, pool: &WorkerPool, job_id: Uuid) -> JobStatus {
        for _ in 0..60 {
            coordinator.tick_all().await;
            pool.run_until_drained().await.expect("drain");
            coordinator.tick_all().await;

            let job = self
                .ctx
                .store
                .get_job(job_id)
                .await
                .expect("get_job")
                .expect("job exists");
            if job.status.is_terminal() {
                return job.status;
            }
            // Step over retry backoff (cap is 60s).
            self.clock.advance(Duration::seconds(120));
        }
        panic!("job {job_id} did not quiesce");
    }

    pub async fn job_status(&self, job_id: Uuid) -> JobStatus {
        self.ctx
            .store
            .get_job(job_id)
            .await
            .expect("get_job")
            .expect("job exists")
            .status
    }

    /// Final outcome of each batch: the status of its highest attempt.
    pub async fn batch_outcomes(&self, job_id: Uuid) -> Vec<(i32, TaskStatus)> {
        let batches = self.ctx.store.list_batches(job_id).await.expect("batches");
        let tasks = self.ctx.store.list_tasks(job_id, None).await.expect("tasks");
        let mut out = Vec::new();
        for batch in batches {
            let latest = tasks
                .iter()
                .filter(|t| t.role == TaskRole::Worker && t.batch_id == batch.id)
                .max_by_key(|t| t.attempt)
                .expect("batch has tasks");
            out.push((batch.seq, latest.status));
        }
        out
    }

    pub async fn final_aggregate(&self, job_id: Uuid, ext: &str) -> Option<String> {
        let path = self.ctx.artifacts.final_path(job_id, ext);
        std::fs::read_to_string(path).ok()
    }
}

// ----------------------------
// Failure-drill handlers
// ----------------------------

fn echo_output(ctx: &TaskCtx) -> (Uuid, Uuid) {
    (ctx.task.job_id, ctx.task.id)
}

async fn echo_run(ctx: &TaskCtx) -> Result<String, HandlerError> {
    let batch = ctx.batch()?;
    let lines = ctx
        .artifacts
        .read_lines(&batch.input_ref)
        .await
        .map_err(|e| HandlerError::terminal(ErrorKind::HandlerFailure, e.to_string()))?;
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    let (job_id, task_id) = echo_output(ctx);
    let written = ctx
        .artifacts
        .write_task_output(job_id, task_id, "txt", content.as_bytes())
        .await
        .map_err(|e| HandlerError::retryable(ErrorKind::Unknown, e.to_string()))?;
    Ok(written.uri)
}

/// Fails retryably on the attempts below `fail_attempts` (default 1), then
/// echoes.
pub struct FlakyEcho;

#[async_trait]
impl Handler for FlakyEcho {
    fn name(&self) -> &'static str {
        "flaky-echo"
    }

    fn output_ext(&self) -> &'static str {
        "txt"
    }

    async fn run(&self, ctx: &TaskCtx) -> Result<String, HandlerError> {
        let fail_attempts = ctx.job.config["fail_attempts"].as_i64().unwrap_or(1) as i32;
        if ctx.task.attempt <= fail_attempts {
            return Err(HandlerError::retryable(
                ErrorKind::Timeout,
                format!("flaking on attempt {}", ctx.task.attempt),
            ));
        }
        echo_run(ctx).await
    }
}

/// Never succeeds; always a retryable failure.
pub struct AlwaysRetryable;

#[async_trait]
impl Handler for AlwaysRetryable {
    fn name(&self) -> &'static str {
        "always-retryable"
    }

    async fn run(&self, ctx: &TaskCtx) -> Result<String, HandlerError> {
        let _ = ctx;
        Err(HandlerError::retryable(
            ErrorKind::Network,
            "simulated transient failure",
        ))
    }
}

/// Echoes every batch except `fail_seq`, which fails. `fail_mode` picks
/// "terminal" (default) or "retryable".
pub struct FailSeqTerminal;

#[async_trait]
impl Handler for FailSeqTerminal {
    fn name(&self) -> &'static str {
        "fail-seq"
    }

    fn output_ext(&self) -> &'static str {
        "txt"
    }

    async fn run(&self, ctx: &TaskCtx) -> Result<String, HandlerError> {
        let fail_seq = ctx.job.config["fail_seq"].as_i64().unwrap_or(-1) as i32;
        let batch = ctx.batch()?;
        if batch.seq == fail_seq {
            let retryable = ctx.job.config["fail_mode"].as_str() == Some("retryable");
            if retryable {
                return Err(HandlerError::retryable(
                    ErrorKind::Timeout,
                    format!("batch {} keeps failing", batch.seq),
                ));
            }
            return Err(HandlerError::terminal(
                ErrorKind::HandlerFailure,
                format!("batch {} cannot succeed", batch.seq),
            ));
        }
        echo_run(ctx).await
    }
}

/// Crashes the slot's handler task every time.
pub struct PanicAlways;

#[async_trait]
impl Handler for PanicAlways {
    fn name(&self) -> &'static str {
        "panic-always"
    }

    async fn run(&self, ctx: &TaskCtx) -> Result<String, HandlerError> {
        panic!("boom on attempt {}", ctx.task.attempt);
    }
}

/// Echo through the shared `atproto` bucket: one token per record.
pub struct LimitedEcho;

#[async_trait]
impl Handler for LimitedEcho {
    fn name(&self) -> &'static str {
        "limited-echo"
    }

    fn output_ext(&self) -> &'static str {
        "txt"
    }

    async fn run(&self, ctx: &TaskCtx) -> Result<String, HandlerError> {
        use skyflow::ratelimit::Acquire;

        let batch = ctx.batch()?;
        let lines = ctx
            .artifacts
            .read_lines(&batch.input_ref)
            .await
            .map_err(|e| HandlerError::terminal(ErrorKind::HandlerFailure, e.to_string()))?;
        for _ in &lines {
            match ctx
                .limiter
                .try_acquire("atproto", 1.0)
                .await
                .map_err(|e| HandlerError::retryable(ErrorKind::Unknown, e.to_string()))?
            {
                Acquire::Granted { .. } => {}
                Acquire::RetryAfter { ms } => {
                    return Err(HandlerError::retryable(
                        ErrorKind::RateLimited,
                        format!("bucket empty, retry in {ms}ms"),
                    ));
                }
            }
        }
        echo_run(ctx).await
    }
}
