use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::store::model::{
    Batch, HeartbeatStatus, Job, JobFailure, JobFilter, JobStatus, Task, TaskCountRow, TaskCounts,
    TaskError, TaskOutcome, TaskRole, TaskStatus, TokenBucket,
};
use crate::store::{StateStore, StoreError, StoreResult};

const JOB_COLUMNS: &str = "id, name, handler_ref, config, status, submitted_by, submitted_at, \
     completed_at, orphans_reclaimed, failure, created_at, updated_at";

const TASK_COLUMNS: &str = "id, job_id, batch_id, role, phase, attempt, status, priority, \
     run_at, lease_owner, lease_expires_at, heartbeat_at, output_ref, error, created_at, updated_at";

/// Durable [`StateStore`] on Postgres.
///
/// Leasing goes through `FOR UPDATE SKIP LOCKED` so no two workers claim the
/// same task; all other mutations are single-statement conditional updates
/// bound to the lease owner or the current status.
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    handler_ref: String,
    config: Value,
    status: String,
    submitted_by: String,
    submitted_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    orphans_reclaimed: i64,
    failure: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn into_job(self) -> StoreResult<Job> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Unavailable(format!("bad job status {}", self.status)))?;
        let failure = match self.failure {
            Some(v) => Some(
                serde_json::from_value::<JobFailure>(v)
                    .map_err(|e| StoreError::Unavailable(format!("bad job failure: {e}")))?,
            ),
            None => None,
        };
        Ok(Job {
            id: self.id,
            name: self.name,
            handler_ref: self.handler_ref,
            config: self.config,
            status,
            submitted_by: self.submitted_by,
            submitted_at: self.submitted_at,
            completed_at: self.completed_at,
            orphans_reclaimed: self.orphans_reclaimed,
            failure,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    job_id: Uuid,
    batch_id: Uuid,
    role: String,
    phase: String,
    attempt: i32,
    status: String,
    priority: i32,
    run_at: DateTime<Utc>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    output_ref: Option<String>,
    error: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> StoreResult<Task> {
        let role = TaskRole::parse(&self.role)
            .ok_or_else(|| StoreError::Unavailable(format!("bad task role {}", self.role)))?;
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Unavailable(format!("bad task status {}", self.status)))?;
        let error = match self.error {
            Some(v) => Some(
                serde_json::from_value::<TaskError>(v)
                    .map_err(|e| StoreError::Unavailable(format!("bad task error: {e}")))?,
            ),
            None => None,
        };
        Ok(Task {
            id: self.id,
            job_id: self.job_id,
            batch_id: self.batch_id,
            role,
            phase: self.phase,
            attempt: self.attempt,
            status,
            priority: self.priority,
            run_at: self.run_at,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at,
            heartbeat_at: self.heartbeat_at,
            output_ref: self.output_ref,
            error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn error_json(error: &TaskError) -> StoreResult<Value> {
    serde_json::to_value(error).map_err(|e| StoreError::Unavailable(e.to_string()))
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn put_job(&self, job: &Job) -> StoreResult<()> {
        let failure = job
            .failure
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, handler_ref, config, status, submitted_by, submitted_at,
                completed_at, orphans_reclaimed, failure, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.handler_ref)
        .bind(&job.config)
        .bind(job.status.as_str())
        .bind(&job.submitted_by)
        .bind(job.submitted_at)
        .bind(job.completed_at)
        .bind(job.orphans_reclaimed)
        .bind(failure)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let limit = filter.limit.unwrap_or(200).clamp(1, 500);
        let rows = match filter.status {
            Some(status) => {
                sqlx::query_as::<_, JobRow>(&format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM jobs
                    WHERE status = $1 AND deleted_at IS NULL
                    ORDER BY submitted_at DESC, id DESC
                    LIMIT $2
                    "#
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(&format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM jobs
                    WHERE deleted_at IS NULL
                    ORDER BY submitted_at DESC, id DESC
                    LIMIT $1
                    "#
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> StoreResult<bool> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, updated_at = now()
            WHERE id = $1 AND status = ANY($3) AND deleted_at IS NULL
            "#,
        )
        .bind(job_id)
        .bind(to.as_str())
        .bind(&from)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_job_failure(&self, job_id: Uuid, failure: &JobFailure) -> StoreResult<()> {
        let failure =
            serde_json::to_value(failure).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        sqlx::query("UPDATE jobs SET failure = $2, updated_at = now() WHERE id = $1")
            .bind(job_id)
            .bind(failure)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_completed_at(&self, job_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET completed_at = now(), updated_at = now()
            WHERE id = $1 AND completed_at IS NULL
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_job(&self, job_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE jobs SET deleted_at = now(), updated_at = now() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_batches(&self, batches: &[Batch]) -> StoreResult<()> {
        for b in batches {
            sqlx::query(
                r#"
                INSERT INTO batches (id, job_id, seq, input_ref, record_count, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(b.id)
            .bind(b.job_id)
            .bind(b.seq)
            .bind(&b.input_ref)
            .bind(b.record_count)
            .bind(b.created_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> StoreResult<Option<Batch>> {
        let row = sqlx::query_as::<_, (Uuid, Uuid, i32, String, i64, DateTime<Utc>)>(
            "SELECT id, job_id, seq, input_ref, record_count, created_at FROM batches WHERE id = $1",
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, job_id, seq, input_ref, record_count, created_at)| Batch {
            id,
            job_id,
            seq,
            input_ref,
            record_count,
            created_at,
        }))
    }

    async fn list_batches(&self, job_id: Uuid) -> StoreResult<Vec<Batch>> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, i32, String, i64, DateTime<Utc>)>(
            r#"
            SELECT id, job_id, seq, input_ref, record_count, created_at
            FROM batches
            WHERE job_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, job_id, seq, input_ref, record_count, created_at)| Batch {
                id,
                job_id,
                seq,
                input_ref,
                record_count,
                created_at,
            })
            .collect())
    }

    async fn create_task(&self, task: &Task) -> StoreResult<()> {
        let error = task.error.as_ref().map(error_json).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, job_id, batch_id, role, phase, attempt, status, priority, run_at,
                lease_owner, lease_expires_at, heartbeat_at, output_ref, error,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(task.id)
        .bind(task.job_id)
        .bind(task.batch_id)
        .bind(task.role.as_str())
        .bind(&task.phase)
        .bind(task.attempt)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.run_at)
        .bind(&task.lease_owner)
        .bind(task.lease_expires_at)
        .bind(task.heartbeat_at)
        .bind(&task.output_ref)
        .bind(error)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> StoreResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn list_tasks(
        &self,
        job_id: Uuid,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<Task>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    r#"
                    SELECT {TASK_COLUMNS} FROM tasks
                    WHERE job_id = $1 AND status = $2
                    ORDER BY created_at ASC, id ASC
                    "#
                ))
                .bind(job_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    r#"
                    SELECT {TASK_COLUMNS} FROM tasks
                    WHERE job_id = $1
                    ORDER BY created_at ASC, id ASC
                    "#
                ))
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn list_terminal_tasks(&self, job_id: Uuid) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE job_id = $1
              AND status IN ('success', 'failed_retryable', 'failed_terminal', 'cancelled')
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn lease_ready_tasks(
        &self,
        worker_id: &str,
        max_n: usize,
        lease: Duration,
    ) -> StoreResult<(Vec<Task>, u64)> {
        let mut tx = self.pool.begin().await?;

        // 1) Pick candidates and lock the rows so no other worker sees them.
        let candidates = sqlx::query_as::<_, (Uuid, String, Uuid)>(
            r#"
            SELECT t.id, t.status, t.job_id
            FROM tasks t
            JOIN jobs j ON j.id = t.job_id
            WHERE j.deleted_at IS NULL
              AND j.status NOT IN ('cancelled', 'completed', 'failed')
              AND (
                    (t.status = 'pending' AND t.run_at <= now())
                 OR (t.status IN ('leased', 'running') AND t.lease_expires_at < now())
              )
            ORDER BY t.priority DESC, t.created_at ASC
            FOR UPDATE OF t SKIP LOCKED
            LIMIT $1
            "#,
        )
        .bind(max_n as i64)
        .fetch_all(&mut *tx)
        .await?;

        if candidates.is_empty() {
            tx.commit().await?;
            return Ok((Vec::new(), 0));
        }

        // 2) Account reclaimed orphans on their jobs.
        let reclaimed = candidates.iter().filter(|(_, s, _)| s != "pending").count() as u64;
        for (_, _, job_id) in candidates.iter().filter(|(_, s, _)| s != "pending") {
            sqlx::query(
                r#"
                UPDATE jobs
                SET orphans_reclaimed = orphans_reclaimed + 1, updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }

        // 3) Lease them.
        let ids: Vec<Uuid> = candidates.iter().map(|(id, _, _)| *id).collect();
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            UPDATE tasks
            SET status = 'leased',
                lease_owner = $2,
                lease_expires_at = now() + ($3::bigint * interval '1 millisecond'),
                heartbeat_at = now(),
                updated_at = now()
            WHERE id = ANY($1)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(&ids)
        .bind(worker_id)
        .bind(lease.num_milliseconds())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut tasks: Vec<Task> = rows
            .into_iter()
            .map(TaskRow::into_task)
            .collect::<StoreResult<_>>()?;
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok((tasks, reclaimed))
    }

    async fn mark_task_running(&self, task_id: Uuid, worker_id: &str) -> StoreResult<()> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'running', updated_at = now()
            WHERE id = $1 AND lease_owner = $2 AND status IN ('leased', 'running')
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::LeaseLost {
                task_id,
                owner: worker_id.to_string(),
            });
        }
        Ok(())
    }

    async fn heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        extend: Duration,
    ) -> StoreResult<HeartbeatStatus> {
        let row = sqlx::query_as::<_, (Option<String>, String, String)>(
            r#"
            SELECT t.lease_owner, t.status, j.status
            FROM tasks t
            JOIN jobs j ON j.id = t.job_id
            WHERE t.id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((owner, status, job_status)) = row else {
            return Ok(HeartbeatStatus::Lost);
        };
        if owner.as_deref() != Some(worker_id) || !matches!(status.as_str(), "leased" | "running")
        {
            return Ok(HeartbeatStatus::Lost);
        }
        if job_status == "cancelled" {
            return Ok(HeartbeatStatus::Cancelled);
        }

        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET lease_expires_at = now() + ($3::bigint * interval '1 millisecond'),
                heartbeat_at = now(),
                updated_at = now()
            WHERE id = $1 AND lease_owner = $2 AND status IN ('leased', 'running')
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(extend.num_milliseconds())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Ok(HeartbeatStatus::Lost);
        }
        Ok(HeartbeatStatus::Ok)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        outcome: &TaskOutcome,
    ) -> StoreResult<()> {
        let (status, output_ref, error) = match outcome {
            TaskOutcome::Success { output_ref } => {
                (TaskStatus::Success, Some(output_ref.clone()), None)
            }
            TaskOutcome::Retryable { error } => {
                (TaskStatus::FailedRetryable, None, Some(error_json(error)?))
            }
            TaskOutcome::Terminal { error } => {
                (TaskStatus::FailedTerminal, None, Some(error_json(error)?))
            }
        };

        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $3,
                output_ref = $4,
                error = $5,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND lease_owner = $2 AND status IN ('leased', 'running')
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(status.as_str())
        .bind(&output_ref)
        .bind(&error)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() > 0 {
            return Ok(());
        }

        // Conditional write missed: idempotent retry, terminal conflict, or a
        // reclaimed lease.
        let current = self.get_task(task_id).await?;
        let Some(current) = current else {
            return Err(StoreError::NotFound(format!("task {task_id}")));
        };
        if current.status.is_terminal() {
            let same = current.status == outcome.status()
                && match outcome {
                    TaskOutcome::Success { output_ref } => {
                        current.output_ref.as_deref() == Some(output_ref.as_str())
                    }
                    TaskOutcome::Retryable { error } | TaskOutcome::Terminal { error } => {
                        current.error.as_ref() == Some(error)
                    }
                };
            if same {
                return Ok(());
            }
            return Err(StoreError::Conflict(format!(
                "task {task_id} already terminal ({})",
                current.status.as_str()
            )));
        }
        Err(StoreError::LeaseLost {
            task_id,
            owner: worker_id.to_string(),
        })
    }

    async fn expire_leases(&self) -> StoreResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                lease_owner = NULL,
                lease_expires_at = NULL,
                heartbeat_at = NULL,
                updated_at = now()
            WHERE status IN ('leased', 'running')
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn escalate_retryable(&self, job_id: Uuid, phase: &str) -> StoreResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed_terminal', updated_at = now()
            WHERE job_id = $1 AND phase = $2 AND status = 'failed_retryable'
            "#,
        )
        .bind(job_id)
        .bind(phase)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn cancel_pending_tasks(&self, job_id: Uuid) -> StoreResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'cancelled', updated_at = now()
            WHERE job_id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn count_tasks(&self, job_id: Uuid) -> StoreResult<TaskCounts> {
        let rows = sqlx::query_as::<_, (String, String, String, i64)>(
            r#"
            SELECT role, phase, status, COUNT(*)
            FROM tasks
            WHERE job_id = $1
            GROUP BY role, phase, status
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (role, phase, status, count) in rows {
            let role = TaskRole::parse(&role)
                .ok_or_else(|| StoreError::Unavailable(format!("bad task role {role}")))?;
            let status = TaskStatus::parse(&status)
                .ok_or_else(|| StoreError::Unavailable(format!("bad task status {status}")))?;
            out.push(TaskCountRow {
                role,
                phase,
                status,
                count,
            });
        }
        Ok(TaskCounts { rows: out })
    }

    async fn queue_depth(&self) -> StoreResult<i64> {
        let depth: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM tasks t
            JOIN jobs j ON j.id = t.job_id
            WHERE t.status = 'pending'
              AND t.run_at <= now()
              AND j.deleted_at IS NULL
              AND j.status NOT IN ('cancelled', 'completed', 'failed')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(depth)
    }

    async fn acquire_job_lock(
        &self,
        job_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_owner = $2,
                lock_expires_at = now() + ($3::bigint * interval '1 millisecond')
            WHERE id = $1
              AND (lock_owner IS NULL OR lock_owner = $2 OR lock_expires_at < now())
            "#,
        )
        .bind(job_id)
        .bind(owner)
        .bind(ttl.num_milliseconds())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn release_job_lock(&self, job_id: Uuid, owner: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lock_owner = NULL, lock_expires_at = NULL
            WHERE id = $1 AND lock_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_bucket(&self, key: &str) -> StoreResult<Option<TokenBucket>> {
        let row = sqlx::query_as::<_, (f64, f64, f64, DateTime<Utc>, i64)>(
            r#"
            SELECT capacity, refill_per_sec, available, last_refill_at, version
            FROM buckets
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(
            row.map(|(capacity, refill_per_sec, available, last_refill_at, version)| {
                TokenBucket {
                    capacity,
                    refill_per_sec,
                    available,
                    last_refill_at,
                    version,
                }
            }),
        )
    }

    async fn store_bucket(
        &self,
        key: &str,
        expected_version: i64,
        bucket: &TokenBucket,
    ) -> StoreResult<bool> {
        if expected_version == 0 {
            let res = sqlx::query(
                r#"
                INSERT INTO buckets (key, capacity, refill_per_sec, available, last_refill_at, version)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(bucket.capacity)
            .bind(bucket.refill_per_sec)
            .bind(bucket.available)
            .bind(bucket.last_refill_at)
            .bind(bucket.version)
            .execute(&self.pool)
            .await?;
            return Ok(res.rows_affected() > 0);
        }

        let res = sqlx::query(
            r#"
            UPDATE buckets
            SET capacity = $3,
                refill_per_sec = $4,
                available = $5,
                last_refill_at = $6,
                version = $7
            WHERE key = $1 AND version = $2
            "#,
        )
        .bind(key)
        .bind(expected_version)
        .bind(bucket.capacity)
        .bind(bucket.refill_per_sec)
        .bind(bucket.available)
        .bind(bucket.last_refill_at)
        .bind(bucket.version)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }
}
