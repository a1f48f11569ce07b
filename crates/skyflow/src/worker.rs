use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregate;
use crate::config::JobSpec;
use crate::context::RuntimeContext;
use crate::handler::{Handler, HandlerError, TaskCtx, TaskLogger};
use crate::metrics::RuntimeMetrics;
use crate::retry::ErrorKind;
use crate::store::{HeartbeatStatus, StateStore, StoreError, Task, TaskError, TaskRole};

const IDLE_POLL: Duration = Duration::from_millis(250);
const ERROR_BACKOFF: Duration = Duration::from_millis(500);
/// Grace between cooperative cancellation and dropping the handler future.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

// Heartbeat loop verdicts, shared with the executing slot.
const HB_LIVE: u8 = 0;
const HB_ABANDON: u8 = 1;
const HB_JOB_CANCELLED: u8 = 2;

/// N independent execution slots pulling from the shared queue. Each slot is
/// its own failure domain: a panicking handler costs one task, not the pool.
#[derive(Clone)]
pub struct WorkerPool {
    ctx: RuntimeContext,
    worker_id: String,
    lease_seconds: i64,
    dequeue_batch: usize,
    shutdown: CancellationToken,
    /// (job_id, batch_id) -> attempt of the last panic, for poison detection.
    panics: Arc<Mutex<HashMap<(Uuid, Uuid), i32>>>,
}

enum Exec {
    Done(Result<String, HandlerError>),
    Panicked(String),
    TimedOut,
}

impl WorkerPool {
    pub fn new(
        ctx: RuntimeContext,
        worker_id: impl Into<String>,
        lease_seconds: i64,
        dequeue_batch: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            worker_id: worker_id.into(),
            lease_seconds: lease_seconds.max(1),
            dequeue_batch: dequeue_batch.max(1),
            shutdown,
            panics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `slots` slot loops until shutdown.
    pub async fn run(&self, slots: usize) -> anyhow::Result<()> {
        let mut set = JoinSet::new();
        for slot in 0..slots.max(1) {
            let pool = self.clone();
            set.spawn(async move { pool.slot_loop(slot).await });
        }
        while let Some(res) = set.join_next().await {
            res?;
        }
        Ok(())
    }

    /// Process everything currently runnable, then return. Used by one-shot
    /// drains and the test harness; the daemon path is [`run`](Self::run).
    pub async fn run_until_drained(&self) -> anyhow::Result<()> {
        loop {
            let lease = ChronoDuration::seconds(self.lease_seconds);
            let tasks = self
                .ctx
                .queue
                .dequeue(&self.worker_id, self.dequeue_batch, lease)
                .await?;
            if tasks.is_empty() {
                return Ok(());
            }
            for task in tasks {
                self.execute(task, 0).await;
            }
        }
    }

    async fn slot_loop(&self, slot: usize) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let lease = ChronoDuration::seconds(self.lease_seconds);
            let tasks = match self
                .ctx
                .queue
                .dequeue(&self.worker_id, self.dequeue_batch, lease)
                .await
            {
                Ok(tasks) => tasks,
                Err(e) => {
                    tracing::warn!(slot, "dequeue failed: {e}");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };
            if tasks.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    _ = self.shutdown.cancelled() => return,
                }
                continue;
            }
            for task in tasks {
                self.execute(task, slot).await;
            }
        }
    }

    async fn execute(&self, task: Task, slot: usize) {
        let task_id = task.id;
        tracing::debug!(slot, task_id = %task_id, phase = %task.phase, attempt = task.attempt, "executing");

        // Resolve job, spec, and handler; anything missing here is
        // deterministic and terminal.
        let job = match self.ctx.store.get_job(task.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.nack(
                    &task,
                    ErrorKind::HandlerFailure,
                    "job manifest missing",
                    false,
                )
                .await;
                return;
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, "job lookup failed: {e}");
                return;
            }
        };
        if job.status == crate::store::JobStatus::Cancelled {
            RuntimeMetrics::inc(&self.ctx.metrics.tasks_cancelled);
            self.nack(&task, ErrorKind::Cancelled, "job cancelled", false)
                .await;
            return;
        }
        let spec = match JobSpec::from_value(&job.config) {
            Ok(spec) => spec,
            Err(e) => {
                self.nack(
                    &task,
                    ErrorKind::HandlerFailure,
                    format!("bad job config: {e}"),
                    false,
                )
                .await;
                return;
            }
        };
        let Some(handler) = self.ctx.registry.get(&job.handler_ref) else {
            self.nack(
                &task,
                ErrorKind::HandlerFailure,
                format!("unknown handler {}", job.handler_ref),
                false,
            )
            .await;
            return;
        };

        if let Err(e) = self
            .ctx
            .store
            .mark_task_running(task_id, &self.worker_id)
            .await
        {
            tracing::warn!(task_id = %task_id, "lost lease before start: {e}");
            return;
        }

        let batch = if task.role == TaskRole::Worker {
            match self.ctx.store.get_batch(task.batch_id).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(task_id = %task_id, "batch lookup failed: {e}");
                    return;
                }
            }
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let hb_state = Arc::new(AtomicU8::new(HB_LIVE));
        let heartbeat = self.spawn_heartbeat(task_id, cancel.clone(), hb_state.clone());

        let checkpoint = crate::checkpoint::CheckpointHandle::new(
            self.ctx.artifacts.clone(),
            task.job_id,
            task.batch_id,
            task_id,
            task.attempt,
            cancel.clone(),
        );
        let task_ctx = TaskCtx {
            task: task.clone(),
            batch,
            job,
            spec,
            limiter: self.ctx.limiter.clone(),
            checkpoint,
            artifacts: self.ctx.artifacts.clone(),
            logger: TaskLogger::new(self.ctx.artifacts.clone(), task.job_id, task_id),
        };

        let exec = self.drive_handler(task_ctx, handler, cancel.clone()).await;
        heartbeat.abort();

        match hb_state.load(Ordering::SeqCst) {
            HB_JOB_CANCELLED => {
                RuntimeMetrics::inc(&self.ctx.metrics.tasks_cancelled);
                self.nack(&task, ErrorKind::Cancelled, "job cancelled", false)
                    .await;
                return;
            }
            HB_ABANDON => {
                // Lease is gone; stop silently and let whoever reclaimed it
                // own the outcome.
                tracing::warn!(task_id = %task_id, "abandoning task after lost heartbeats");
                return;
            }
            _ => {}
        }

        match exec {
            Exec::Done(Ok(output_ref)) => match self.ctx.artifacts.verify(&output_ref).await {
                Ok(_) => {
                    self.clear_panics(&task);
                    if let Err(e) = self
                        .ctx
                        .queue
                        .ack(task_id, &self.worker_id, output_ref)
                        .await
                    {
                        tracing::warn!(task_id = %task_id, "ack failed: {e}");
                    }
                }
                Err(e) => {
                    self.clear_panics(&task);
                    self.nack(
                        &task,
                        ErrorKind::Unknown,
                        format!("output validation failed: {e}"),
                        true,
                    )
                    .await;
                }
            },
            Exec::Done(Err(err)) => {
                self.clear_panics(&task);
                let mut retryable = err.is_retryable();
                let error = err.to_task_error(task.attempt - 1);
                // Unknown-class failures get a tighter budget than real
                // transients: max_unknown_retries attempts, then terminal.
                if retryable
                    && error.kind == ErrorKind::Unknown.as_str()
                    && task.attempt > self.ctx.retry.max_unknown_retries as i32
                {
                    retryable = false;
                }
                if retryable {
                    RuntimeMetrics::inc(&self.ctx.metrics.handler_errors_retryable);
                } else {
                    RuntimeMetrics::inc(&self.ctx.metrics.handler_errors_terminal);
                }
                self.nack_error(&task, error, retryable).await;
            }
            Exec::TimedOut => {
                self.clear_panics(&task);
                self.nack(
                    &task,
                    ErrorKind::Timeout,
                    "soft timeout: handler exceeded 0.9 x lease",
                    true,
                )
                .await;
            }
            Exec::Panicked(msg) => {
                RuntimeMetrics::inc(&self.ctx.metrics.handler_panics);
                let quarantine = self.record_panic(&task);
                if quarantine {
                    self.nack(
                        &task,
                        ErrorKind::Poisoned,
                        format!("two consecutive crashes on this batch: {msg}"),
                        false,
                    )
                    .await;
                } else {
                    self.nack(&task, ErrorKind::HandlerFailure, msg, true).await;
                }
            }
        }
    }

    /// Run the handler with cooperative soft-timeout cancellation and panic
    /// capture. The handler future runs on its own spawned task so a panic
    /// only takes the slot's current work with it.
    async fn drive_handler(
        &self,
        task_ctx: TaskCtx,
        handler: Arc<dyn Handler>,
        cancel: CancellationToken,
    ) -> Exec {
        let soft_ms = (self.lease_seconds * 1000) as u64 * 9 / 10;
        let rt = self.ctx.clone();
        let role = task_ctx.task.role;
        let mut handle = tokio::spawn(async move {
            match role {
                TaskRole::Aggregator => aggregate::run_aggregation(&rt, &task_ctx, handler).await,
                _ => handler.run(&task_ctx).await,
            }
        });

        tokio::select! {
            joined = &mut handle => flatten_join(joined),
            _ = tokio::time::sleep(Duration::from_millis(soft_ms)) => {
                cancel.cancel();
                match tokio::time::timeout(CANCEL_GRACE, &mut handle).await {
                    Ok(joined) => match flatten_join(joined) {
                        // The handler noticed the token; report the timeout,
                        // not its cancellation error.
                        Exec::Done(Err(e)) if is_cancelled_error(&e) => Exec::TimedOut,
                        other => other,
                    },
                    Err(_) => {
                        handle.abort();
                        Exec::TimedOut
                    }
                }
            }
            _ = cancel.cancelled() => {
                // Heartbeat loop pulled the plug (lost lease or cancelled job).
                match tokio::time::timeout(CANCEL_GRACE, &mut handle).await {
                    Ok(joined) => flatten_join(joined),
                    Err(_) => {
                        handle.abort();
                        Exec::TimedOut
                    }
                }
            }
        }
    }

    /// Heartbeat at lease/3. Two consecutive store failures or a lost lease
    /// abandon the task; a cancelled job stops it terminally.
    fn spawn_heartbeat(
        &self,
        task_id: Uuid,
        cancel: CancellationToken,
        state: Arc<AtomicU8>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.ctx.store.clone();
        let metrics = self.ctx.metrics.clone();
        let worker_id = self.worker_id.clone();
        let lease = ChronoDuration::seconds(self.lease_seconds);
        let interval_ms = (self.lease_seconds * 1000 / 3).max(100) as u64;

        tokio::spawn(async move {
            let mut misses = 0u32;
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                match store.heartbeat(task_id, &worker_id, lease).await {
                    Ok(HeartbeatStatus::Ok) => misses = 0,
                    Ok(HeartbeatStatus::Cancelled) => {
                        state.store(HB_JOB_CANCELLED, Ordering::SeqCst);
                        cancel.cancel();
                        return;
                    }
                    Ok(HeartbeatStatus::Lost) => {
                        RuntimeMetrics::inc(&metrics.heartbeats_lost);
                        state.store(HB_ABANDON, Ordering::SeqCst);
                        cancel.cancel();
                        return;
                    }
                    Err(e) => {
                        misses += 1;
                        tracing::warn!(task_id = %task_id, misses, "heartbeat failed: {e}");
                        if misses >= 2 {
                            RuntimeMetrics::inc(&metrics.heartbeats_lost);
                            state.store(HB_ABANDON, Ordering::SeqCst);
                            cancel.cancel();
                            return;
                        }
                    }
                }
            }
        })
    }

    /// True when this panic is the second in a row for the batch across
    /// consecutive attempts; the task is then quarantined.
    fn record_panic(&self, task: &Task) -> bool {
        let key = (task.job_id, task.batch_id);
        let mut panics = self.panics.lock().unwrap_or_else(|e| e.into_inner());
        match panics.get(&key) {
            Some(&last) if last == task.attempt - 1 => {
                panics.remove(&key);
                true
            }
            _ => {
                panics.insert(key, task.attempt);
                false
            }
        }
    }

    fn clear_panics(&self, task: &Task) {
        let mut panics = self.panics.lock().unwrap_or_else(|e| e.into_inner());
        panics.remove(&(task.job_id, task.batch_id));
    }

    async fn nack(&self, task: &Task, kind: ErrorKind, message: impl Into<String>, retryable: bool) {
        let error = TaskError {
            kind: kind.as_str().to_string(),
            message: message.into(),
            retries_so_far: task.attempt - 1,
        };
        self.nack_error(task, error, retryable).await;
    }

    async fn nack_error(&self, task: &Task, error: TaskError, retryable: bool) {
        match self
            .ctx
            .queue
            .nack(task.id, &self.worker_id, error, retryable)
            .await
        {
            Ok(()) => {}
            Err(StoreError::LeaseLost { .. }) => {
                tracing::warn!(task_id = %task.id, "nack lost to a reclaimed lease");
            }
            Err(e) => tracing::warn!(task_id = %task.id, "nack failed: {e}"),
        }
    }
}

fn flatten_join(joined: Result<Result<String, HandlerError>, tokio::task::JoinError>) -> Exec {
    match joined {
        Ok(res) => Exec::Done(res),
        Err(e) if e.is_panic() => Exec::Panicked(format!("handler panicked: {e}")),
        Err(e) => Exec::Panicked(format!("handler task aborted: {e}")),
    }
}

/// A handler that bailed out because it observed the cancellation token.
fn is_cancelled_error(err: &HandlerError) -> bool {
    let kind = match err {
        HandlerError::Retryable { kind, .. } | HandlerError::Terminal { kind, .. } => kind,
    };
    kind == ErrorKind::Cancelled.as_str()
}
