use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

pub mod memory;
pub mod model;
pub mod postgres;

pub use memory::MemStateStore;
pub use model::{
    Batch, HeartbeatStatus, Job, JobFailure, JobFilter, JobStatus, Task, TaskCountRow, TaskCounts,
    TaskError, TaskOutcome, TaskRole, TaskStatus, TokenBucket,
};
pub use postgres::PgStateStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("lease lost for task {task_id} (owner {owner})")]
    LeaseLost { task_id: Uuid, owner: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            // 23505 = unique_violation
            if db.code().as_deref() == Some("23505") {
                return StoreError::Conflict(db.to_string());
            }
        }
        StoreError::Unavailable(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable job/batch/task state with leasing, plus the shared token-bucket
/// rows and the job-scoped coordinator lock.
///
/// Every method is atomic at the granularity of the entity it touches.
/// Mutations are conditional: task writes are bound to the lease owner, job
/// status changes are compare-and-swap on the current status, bucket writes
/// are compare-and-swap on a version counter.
#[async_trait]
pub trait StateStore: Send + Sync {
    // ----------------------------
    // Jobs
    // ----------------------------

    /// Insert a job manifest. `Conflict` if the id already exists.
    async fn put_job(&self, job: &Job) -> StoreResult<()>;
    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>>;
    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>>;

    /// Conditional status change; returns false when the current status is
    /// not in `from`.
    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> StoreResult<bool>;

    async fn set_job_failure(&self, job_id: Uuid, failure: &JobFailure) -> StoreResult<()>;
    async fn set_completed_at(&self, job_id: Uuid) -> StoreResult<()>;

    /// Tombstone a job and everything it owns.
    async fn delete_job(&self, job_id: Uuid) -> StoreResult<()>;

    // ----------------------------
    // Batches
    // ----------------------------

    /// Idempotent by batch id: re-inserting an existing batch is a no-op.
    async fn create_batches(&self, batches: &[Batch]) -> StoreResult<()>;
    async fn get_batch(&self, batch_id: Uuid) -> StoreResult<Option<Batch>>;
    async fn list_batches(&self, job_id: Uuid) -> StoreResult<Vec<Batch>>;

    // ----------------------------
    // Tasks + leasing
    // ----------------------------

    /// `Conflict` if `(job_id, batch_id, attempt)` already exists.
    async fn create_task(&self, task: &Task) -> StoreResult<()>;
    async fn get_task(&self, task_id: Uuid) -> StoreResult<Option<Task>>;
    async fn list_tasks(&self, job_id: Uuid, status: Option<TaskStatus>)
        -> StoreResult<Vec<Task>>;
    async fn list_terminal_tasks(&self, job_id: Uuid) -> StoreResult<Vec<Task>>;

    /// Atomically pop up to `max_n` runnable tasks and lease them to
    /// `worker_id`. A task is runnable when it is PENDING with `run_at` due,
    /// or LEASED/RUNNING with an expired lease (reclaim; bumps the job's
    /// `orphans_reclaimed`). Tasks of cancelled or tombstoned jobs are
    /// skipped. Ordering: priority DESC, then creation order. Returns the
    /// leased tasks and how many of them were reclaimed from expired leases.
    async fn lease_ready_tasks(
        &self,
        worker_id: &str,
        max_n: usize,
        lease: Duration,
    ) -> StoreResult<(Vec<Task>, u64)>;

    /// LEASED -> RUNNING, bound to the lease owner.
    async fn mark_task_running(&self, task_id: Uuid, worker_id: &str) -> StoreResult<()>;

    /// Extend the lease iff the caller still owns it.
    async fn heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        extend: Duration,
    ) -> StoreResult<HeartbeatStatus>;

    /// Write a terminal status plus output/error, bound to the lease owner.
    /// Retrying the same outcome after it already took effect is a no-op;
    /// an ownership mismatch on a live lease is `LeaseLost`; a different
    /// outcome on an already-terminal task is `Conflict`.
    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        outcome: &TaskOutcome,
    ) -> StoreResult<()>;

    /// Flip expired LEASED/RUNNING tasks back to PENDING (same attempt).
    async fn expire_leases(&self) -> StoreResult<u64>;

    /// FAILED_RETRYABLE -> FAILED_TERMINAL for the given phase, used by the
    /// retry planner once the phase budget is exhausted.
    async fn escalate_retryable(&self, job_id: Uuid, phase: &str) -> StoreResult<u64>;

    /// PENDING -> CANCELLED for every queued task of a cancelled job.
    async fn cancel_pending_tasks(&self, job_id: Uuid) -> StoreResult<u64>;

    async fn count_tasks(&self, job_id: Uuid) -> StoreResult<TaskCounts>;

    /// Runnable PENDING tasks across all live jobs.
    async fn queue_depth(&self) -> StoreResult<i64>;

    // ----------------------------
    // Coordinator lock
    // ----------------------------

    /// Job-scoped lock; succeeds when unheld, expired, or already held by
    /// `owner` (renewal).
    async fn acquire_job_lock(&self, job_id: Uuid, owner: &str, ttl: Duration)
        -> StoreResult<bool>;
    async fn release_job_lock(&self, job_id: Uuid, owner: &str) -> StoreResult<()>;

    // ----------------------------
    // Token buckets
    // ----------------------------

    async fn load_bucket(&self, key: &str) -> StoreResult<Option<TokenBucket>>;

    /// Compare-and-swap on `version`. `expected_version == 0` inserts a new
    /// row. Returns false on version mismatch (caller re-reads and retries).
    async fn store_bucket(
        &self,
        key: &str,
        expected_version: i64,
        bucket: &TokenBucket,
    ) -> StoreResult<bool>;
}
