use chrono::Duration as ChronoDuration;
use rand::{rngs::StdRng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::JobSpec;
use crate::context::RuntimeContext;
use crate::handler::HandlerError;
use crate::metrics::RuntimeMetrics;
use crate::retry::{next_delay_ms, RetryConfig};
use crate::store::{
    Batch, Job, JobFailure, JobFilter, JobStatus, StateStore, StoreError, StoreResult, Task,
    TaskError, TaskRole, TaskStatus,
};

pub const INITIAL_PHASE: &str = "initial";
pub const AGGREGATION_PHASE: &str = "aggregation";
const LOCK_TTL_MS: i64 = 15_000;
const AGGREGATOR_PRIORITY: i32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unknown handler {0}")]
    UnknownHandler(String),
    #[error("partitioning failed: {0}")]
    Partition(HandlerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Drives job lifecycles: intake, task emission, retry phases, aggregation
/// trigger. Stateless across restarts; every decision derives from the store
/// and every write is idempotent, so a tick can be replayed. The job-scoped
/// lock keeps two coordinators off the same job.
pub struct Coordinator {
    ctx: RuntimeContext,
    owner: String,
    tick_interval: Duration,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(
        ctx: RuntimeContext,
        owner: impl Into<String>,
        tick_interval_ms: u64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            owner: owner.into(),
            tick_interval: Duration::from_millis(tick_interval_ms.max(10)),
            shutdown,
        }
    }

    // ----------------------------
    // Intake
    // ----------------------------

    /// Validate, write the manifest, partition into batches, and enqueue the
    /// initial task group.
    pub async fn submit(
        ctx: &RuntimeContext,
        spec: JobSpec,
        submitted_by: &str,
    ) -> Result<Uuid, SubmitError> {
        spec.validate().map_err(SubmitError::InvalidConfig)?;
        let handler = ctx
            .registry
            .get(&spec.handler_ref)
            .ok_or_else(|| SubmitError::UnknownHandler(spec.handler_ref.clone()))?;

        let now = ctx.clock.now();
        let config =
            serde_json::to_value(&spec).map_err(|e| SubmitError::InvalidConfig(e.to_string()))?;
        let job = Job {
            id: Uuid::new_v4(),
            name: spec.name.clone(),
            handler_ref: spec.handler_ref.clone(),
            config,
            status: JobStatus::Pending,
            submitted_by: submitted_by.to_string(),
            submitted_at: now,
            completed_at: None,
            orphans_reclaimed: 0,
            failure: None,
            created_at: now,
            updated_at: now,
        };
        ctx.store.put_job(&job).await?;

        let seeds = handler
            .partition(ctx, &job, &spec)
            .await
            .map_err(SubmitError::Partition)?;
        let batches: Vec<Batch> = seeds
            .into_iter()
            .map(|seed| Batch {
                id: Uuid::new_v4(),
                job_id: job.id,
                seq: seed.seq,
                input_ref: seed.input_ref,
                record_count: seed.record_count,
                created_at: now,
            })
            .collect();
        ctx.store.create_batches(&batches).await?;

        let tasks: Vec<Task> = batches
            .iter()
            .map(|b| Task::new(job.id, b.id, TaskRole::Worker, INITIAL_PHASE, 1, 0, now))
            .collect();
        ctx.queue.enqueue(&tasks).await?;

        tracing::info!(job_id = %job.id, batches = batches.len(), handler = %spec.handler_ref, "job submitted");
        Ok(job.id)
    }

    /// Cancel: stop emitting, cancel queued tasks, leave leased tasks to be
    /// nacked on their next heartbeat, skip aggregation.
    pub async fn cancel(ctx: &RuntimeContext, job_id: Uuid) -> StoreResult<bool> {
        let changed = ctx
            .store
            .transition_job(
                job_id,
                &[JobStatus::Pending, JobStatus::Running, JobStatus::Aggregating],
                JobStatus::Cancelled,
            )
            .await?;
        if changed {
            let cancelled = ctx.store.cancel_pending_tasks(job_id).await?;
            tracing::info!(job_id = %job_id, cancelled, "job cancelled");
        }
        Ok(changed)
    }

    // ----------------------------
    // Tick loop
    // ----------------------------

    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            self.tick_all().await;
            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// One pass over every live job. Per-job errors are logged and absorbed;
    /// the next tick retries them.
    pub async fn tick_all(&self) {
        for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Aggregating] {
            let filter = JobFilter {
                status: Some(status),
                limit: Some(500),
            };
            let jobs = match self.ctx.store.list_jobs(&filter).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::warn!("job scan failed: {e}");
                    continue;
                }
            };
            for job in jobs {
                if let Err(e) = self.tick_job(job.id).await {
                    tracing::warn!(job_id = %job.id, "tick failed: {e}");
                }
            }
        }
    }

    pub async fn tick_job(&self, job_id: Uuid) -> anyhow::Result<()> {
        let ttl = ChronoDuration::milliseconds(LOCK_TTL_MS);
        if !self.ctx.store.acquire_job_lock(job_id, &self.owner, ttl).await? {
            return Ok(());
        }
        let result = self.tick_job_locked(job_id).await;
        self.ctx.store.release_job_lock(job_id, &self.owner).await?;
        result
    }

    async fn tick_job_locked(&self, job_id: Uuid) -> anyhow::Result<()> {
        let Some(job) = self.ctx.store.get_job(job_id).await? else {
            return Ok(());
        };
        let spec = JobSpec::from_value(&job.config)
            .map_err(|e| anyhow::anyhow!("job {job_id} config unreadable: {e}"))?;
        let retry_cfg = spec.retry_config(&self.ctx.retry);

        match job.status {
            JobStatus::Pending => self.tick_pending(&job).await,
            JobStatus::Running => self.tick_running(&job, &retry_cfg).await,
            JobStatus::Aggregating => self.tick_aggregating(&job, &retry_cfg).await,
            _ => Ok(()),
        }
    }

    /// PENDING: make sure the initial task group exists (restart recovery),
    /// complete zero-batch jobs, and promote once work has started.
    async fn tick_pending(&self, job: &Job) -> anyhow::Result<()> {
        let batches = self.ctx.store.list_batches(job.id).await?;
        if batches.is_empty() {
            if self
                .ctx
                .store
                .transition_job(job.id, &[JobStatus::Pending], JobStatus::Completed)
                .await?
            {
                self.ctx.store.set_completed_at(job.id).await?;
                tracing::info!(job_id = %job.id, "zero-batch job completed");
            }
            return Ok(());
        }

        let tasks = self.ctx.store.list_tasks(job.id, None).await?;
        let have: HashSet<Uuid> = tasks
            .iter()
            .filter(|t| t.role == TaskRole::Worker)
            .map(|t| t.batch_id)
            .collect();
        let now = self.ctx.clock.now();
        let missing: Vec<Task> = batches
            .iter()
            .filter(|b| !have.contains(&b.id))
            .map(|b| Task::new(job.id, b.id, TaskRole::Worker, INITIAL_PHASE, 1, 0, now))
            .collect();
        if !missing.is_empty() {
            let created = self.ctx.queue.enqueue(&missing).await?;
            tracing::info!(job_id = %job.id, created, "re-emitted missing initial tasks");
        }

        let counts = self.ctx.store.count_tasks(job.id).await?;
        let started =
            counts.total_role(TaskRole::Worker) > counts.total(TaskRole::Worker, TaskStatus::Pending);
        if started {
            self.ctx
                .store
                .transition_job(job.id, &[JobStatus::Pending], JobStatus::Running)
                .await?;
        }
        Ok(())
    }

    /// RUNNING: once every worker task is terminal, either plan the next
    /// retry phase, promote to AGGREGATING, or fail the job.
    async fn tick_running(&self, job: &Job, retry_cfg: &RetryConfig) -> anyhow::Result<()> {
        let tasks = self.ctx.store.list_tasks(job.id, None).await?;
        let worker_tasks: Vec<&Task> =
            tasks.iter().filter(|t| t.role == TaskRole::Worker).collect();
        if worker_tasks.is_empty() {
            return Ok(());
        }
        if worker_tasks.iter().any(|t| !t.status.is_terminal()) {
            return Ok(());
        }

        // The latest attempt per batch decides the batch's fate.
        let mut latest: HashMap<Uuid, &Task> = HashMap::new();
        for task in &worker_tasks {
            latest
                .entry(task.batch_id)
                .and_modify(|cur| {
                    if task.attempt > cur.attempt {
                        *cur = *task;
                    }
                })
                .or_insert(*task);
        }
        let retryable: Vec<&Task> = latest
            .values()
            .filter(|t| t.status == TaskStatus::FailedRetryable)
            .copied()
            .collect();

        if !retryable.is_empty() {
            let max_attempt = worker_tasks.iter().map(|t| t.attempt).max().unwrap_or(1);
            let phases_used = max_attempt.saturating_sub(1) as u32;
            if phases_used < retry_cfg.max_retry_phases {
                let phase_no = phases_used + 1;
                let phase = format!("retry_{phase_no}");
                let mut rng = StdRng::from_entropy();
                let delay_ms = next_delay_ms(phase_no, retry_cfg, &mut rng);
                let run_at = self.ctx.clock.now() + ChronoDuration::milliseconds(delay_ms as i64);

                let new_tasks: Vec<Task> = retryable
                    .iter()
                    .map(|t| {
                        Task::new(
                            job.id,
                            t.batch_id,
                            TaskRole::Worker,
                            phase.clone(),
                            t.attempt + 1,
                            phase_no as i32,
                            run_at,
                        )
                    })
                    .collect();
                let created = self.ctx.queue.enqueue(&new_tasks).await?;
                RuntimeMetrics::inc(&self.ctx.metrics.retry_phases_planned);
                tracing::info!(job_id = %job.id, phase = %phase, created, delay_ms, "retry phase planned");
                return Ok(());
            }

            // Phase budget spent: the remaining retryable failures become
            // terminal.
            let phases: HashSet<String> = retryable.iter().map(|t| t.phase.clone()).collect();
            for phase in phases {
                let escalated = self.ctx.store.escalate_retryable(job.id, &phase).await?;
                tracing::info!(job_id = %job.id, phase = %phase, escalated, "retry budget exhausted");
            }
        }

        let succeeded = latest
            .values()
            .filter(|t| t.status == TaskStatus::Success)
            .count();
        if succeeded > 0 {
            self.ctx
                .store
                .transition_job(job.id, &[JobStatus::Running], JobStatus::Aggregating)
                .await?;
            return Ok(());
        }

        let failure = build_failure(&latest, &retryable);
        self.fail_job(job.id, failure).await
    }

    /// AGGREGATING: keep exactly one live aggregator attempt until it
    /// succeeds or the retry budget runs out.
    async fn tick_aggregating(&self, job: &Job, retry_cfg: &RetryConfig) -> anyhow::Result<()> {
        let tasks = self.ctx.store.list_tasks(job.id, None).await?;
        let latest_agg = tasks
            .iter()
            .filter(|t| t.role == TaskRole::Aggregator)
            .max_by_key(|t| t.attempt);

        let now = self.ctx.clock.now();
        match latest_agg {
            None => {
                // Aggregator batch id is the job id, so re-creation after a
                // restart hits the identity key instead of duplicating.
                let task = Task::new(
                    job.id,
                    job.id,
                    TaskRole::Aggregator,
                    AGGREGATION_PHASE,
                    1,
                    AGGREGATOR_PRIORITY,
                    now,
                );
                self.ctx.queue.enqueue(&[task]).await?;
                tracing::info!(job_id = %job.id, "aggregation triggered");
                Ok(())
            }
            Some(t) if t.status == TaskStatus::Success => {
                if self
                    .ctx
                    .store
                    .transition_job(job.id, &[JobStatus::Aggregating], JobStatus::Completed)
                    .await?
                {
                    self.ctx.store.set_completed_at(job.id).await?;
                    tracing::info!(job_id = %job.id, "job completed");
                }
                Ok(())
            }
            Some(t) if t.status == TaskStatus::FailedRetryable => {
                if (t.attempt as u32) <= retry_cfg.max_retry_phases {
                    let task = Task::new(
                        job.id,
                        job.id,
                        TaskRole::Aggregator,
                        AGGREGATION_PHASE,
                        t.attempt + 1,
                        AGGREGATOR_PRIORITY,
                        now,
                    );
                    self.ctx.queue.enqueue(&[task]).await?;
                    tracing::info!(job_id = %job.id, attempt = t.attempt + 1, "aggregator retry");
                    Ok(())
                } else {
                    self.ctx
                        .store
                        .escalate_retryable(job.id, AGGREGATION_PHASE)
                        .await?;
                    let failure = aggregation_failure(t);
                    self.fail_job(job.id, failure).await
                }
            }
            Some(t) if t.status == TaskStatus::FailedTerminal => {
                let failure = aggregation_failure(t);
                self.fail_job(job.id, failure).await
            }
            // Leased, running, or cancelled: nothing to decide yet.
            Some(_) => Ok(()),
        }
    }

    /// Mark FAILED, preserving successful worker outputs for manual
    /// recovery.
    async fn fail_job(&self, job_id: Uuid, failure: JobFailure) -> anyhow::Result<()> {
        self.ctx.store.set_job_failure(job_id, &failure).await?;
        if self
            .ctx
            .store
            .transition_job(
                job_id,
                &[JobStatus::Running, JobStatus::Aggregating],
                JobStatus::Failed,
            )
            .await?
        {
            tracing::warn!(job_id = %job_id, phase = %failure.phase_failed, "job failed");
        }
        Ok(())
    }
}

fn build_failure(latest: &HashMap<Uuid, &Task>, retryable: &[&Task]) -> JobFailure {
    let terminal: Vec<&&Task> = latest
        .values()
        .filter(|t| t.status == TaskStatus::FailedTerminal)
        .collect();
    let phase_failed = latest
        .values()
        .filter(|t| t.status != TaskStatus::Success)
        .max_by_key(|t| t.attempt)
        .map(|t| t.phase.clone())
        .unwrap_or_else(|| INITIAL_PHASE.to_string());
    let first_error_sample: Option<TaskError> = latest
        .values()
        .filter(|t| t.status != TaskStatus::Success)
        .filter_map(|t| t.error.clone())
        .next();
    JobFailure {
        phase_failed,
        retryable_count: retryable.len() as i64,
        terminal_count: terminal.len() as i64,
        first_error_sample,
    }
}

fn aggregation_failure(task: &Task) -> JobFailure {
    JobFailure {
        phase_failed: AGGREGATION_PHASE.to_string(),
        retryable_count: 0,
        terminal_count: 1,
        first_error_sample: task.error.clone(),
    }
}
