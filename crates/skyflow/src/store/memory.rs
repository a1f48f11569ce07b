use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::model::{
    Batch, HeartbeatStatus, Job, JobFailure, JobFilter, JobStatus, Task, TaskCountRow, TaskCounts,
    TaskOutcome, TaskStatus, TokenBucket,
};
use crate::store::{StateStore, StoreError, StoreResult};

/// In-process [`StateStore`]. Same observable semantics as the Postgres
/// backend; used by tests and single-process deployments.
pub struct MemStateStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    tombstoned: HashSet<Uuid>,
    batches: HashMap<Uuid, Batch>,
    tasks: HashMap<Uuid, Task>,
    /// (job_id, batch_id, attempt) -> task_id; the task identity index.
    task_identity: HashMap<(Uuid, Uuid, i32), Uuid>,
    /// Insertion order, the FIFO tiebreak within a priority class.
    task_seq: HashMap<Uuid, u64>,
    next_seq: u64,
    job_locks: HashMap<Uuid, (String, DateTime<Utc>)>,
    buckets: HashMap<String, TokenBucket>,
}

impl MemStateStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens after a panic inside another accessor;
        // tests want the state regardless.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn job_accepts_leases(&self, job_id: Uuid) -> bool {
        if self.tombstoned.contains(&job_id) {
            return false;
        }
        match self.jobs.get(&job_id) {
            Some(j) => !matches!(
                j.status,
                JobStatus::Cancelled | JobStatus::Completed | JobStatus::Failed
            ),
            None => false,
        }
    }
}

#[async_trait]
impl StateStore for MemStateStore {
    async fn put_job(&self, job: &Job) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} exists", job.id)));
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<Job>> {
        let inner = self.lock();
        if inner.tombstoned.contains(&job_id) {
            return Ok(None);
        }
        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let inner = self.lock();
        let mut out: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| !inner.tombstoned.contains(&j.id))
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            out.truncate(limit.max(0) as usize);
        }
        Ok(out)
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
    ) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.tombstoned.contains(&job_id) {
            return Err(StoreError::NotFound(format!("job {job_id}")));
        }
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if !from.contains(&job.status) {
            return Ok(false);
        }
        job.status = to;
        job.updated_at = now;
        Ok(true)
    }

    async fn set_job_failure(&self, job_id: Uuid, failure: &JobFailure) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        job.failure = Some(failure.clone());
        job.updated_at = now;
        Ok(())
    }

    async fn set_completed_at(&self, job_id: Uuid) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if job.completed_at.is_none() {
            job.completed_at = Some(now);
            job.updated_at = now;
        }
        Ok(())
    }

    async fn delete_job(&self, job_id: Uuid) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.tombstoned.insert(job_id);
        Ok(())
    }

    async fn create_batches(&self, batches: &[Batch]) -> StoreResult<()> {
        let mut inner = self.lock();
        for b in batches {
            inner.batches.entry(b.id).or_insert_with(|| b.clone());
        }
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> StoreResult<Option<Batch>> {
        Ok(self.lock().batches.get(&batch_id).cloned())
    }

    async fn list_batches(&self, job_id: Uuid) -> StoreResult<Vec<Batch>> {
        let inner = self.lock();
        let mut out: Vec<Batch> = inner
            .batches
            .values()
            .filter(|b| b.job_id == job_id)
            .cloned()
            .collect();
        out.sort_by_key(|b| b.seq);
        Ok(out)
    }

    async fn create_task(&self, task: &Task) -> StoreResult<()> {
        let mut inner = self.lock();
        let identity = (task.job_id, task.batch_id, task.attempt);
        if inner.task_identity.contains_key(&identity) {
            return Err(StoreError::Conflict(format!(
                "task ({}, {}, {}) exists",
                task.job_id, task.batch_id, task.attempt
            )));
        }
        inner.task_identity.insert(identity, task.id);
        inner.tasks.insert(task.id, task.clone());
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.task_seq.insert(task.id, seq);
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> StoreResult<Option<Task>> {
        Ok(self.lock().tasks.get(&task_id).cloned())
    }

    async fn list_tasks(
        &self,
        job_id: Uuid,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<Task>> {
        let inner = self.lock();
        let mut out: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.job_id == job_id)
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|t| inner.task_seq.get(&t.id).copied().unwrap_or(u64::MAX));
        Ok(out)
    }

    async fn list_terminal_tasks(&self, job_id: Uuid) -> StoreResult<Vec<Task>> {
        let inner = self.lock();
        let mut out: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.job_id == job_id && t.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|t| inner.task_seq.get(&t.id).copied().unwrap_or(u64::MAX));
        Ok(out)
    }

    async fn lease_ready_tasks(
        &self,
        worker_id: &str,
        max_n: usize,
        lease: Duration,
    ) -> StoreResult<(Vec<Task>, u64)> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let mut candidates: Vec<(i32, DateTime<Utc>, u64, Uuid)> = inner
            .tasks
            .values()
            .filter(|t| inner.job_accepts_leases(t.job_id))
            .filter(|t| match t.status {
                TaskStatus::Pending => t.run_at <= now,
                TaskStatus::Leased | TaskStatus::Running => {
                    t.lease_expires_at.map_or(false, |at| at < now)
                }
                _ => false,
            })
            .map(|t| {
                (
                    t.priority,
                    t.created_at,
                    inner.task_seq.get(&t.id).copied().unwrap_or(u64::MAX),
                    t.id,
                )
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        candidates.truncate(max_n);

        let mut leased = Vec::with_capacity(candidates.len());
        let mut reclaimed_count = 0u64;
        for (_, _, _, task_id) in candidates {
            let reclaimed_job = match inner.tasks.get_mut(&task_id) {
                Some(task) => {
                    let reclaimed = matches!(task.status, TaskStatus::Leased | TaskStatus::Running);
                    task.status = TaskStatus::Leased;
                    task.lease_owner = Some(worker_id.to_string());
                    task.lease_expires_at = Some(now + lease);
                    task.heartbeat_at = Some(now);
                    task.updated_at = now;
                    leased.push(task.clone());
                    reclaimed.then_some(task.job_id)
                }
                None => None,
            };
            if let Some(job_id) = reclaimed_job {
                reclaimed_count += 1;
                if let Some(job) = inner.jobs.get_mut(&job_id) {
                    job.orphans_reclaimed += 1;
                    job.updated_at = now;
                }
            }
        }
        Ok((leased, reclaimed_count))
    }

    async fn mark_task_running(&self, task_id: Uuid, worker_id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        if task.lease_owner.as_deref() != Some(worker_id)
            || !matches!(task.status, TaskStatus::Leased | TaskStatus::Running)
        {
            return Err(StoreError::LeaseLost {
                task_id,
                owner: worker_id.to_string(),
            });
        }
        task.status = TaskStatus::Running;
        task.updated_at = now;
        Ok(())
    }

    async fn heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        extend: Duration,
    ) -> StoreResult<HeartbeatStatus> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let job_cancelled = {
            let Some(task) = inner.tasks.get(&task_id) else {
                return Ok(HeartbeatStatus::Lost);
            };
            inner
                .jobs
                .get(&task.job_id)
                .map_or(false, |j| j.status == JobStatus::Cancelled)
        };
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(HeartbeatStatus::Lost);
        };
        if task.lease_owner.as_deref() != Some(worker_id)
            || !matches!(task.status, TaskStatus::Leased | TaskStatus::Running)
        {
            return Ok(HeartbeatStatus::Lost);
        }
        if job_cancelled {
            return Ok(HeartbeatStatus::Cancelled);
        }
        task.lease_expires_at = Some(now + extend);
        task.heartbeat_at = Some(now);
        task.updated_at = now;
        Ok(HeartbeatStatus::Ok)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        outcome: &TaskOutcome,
    ) -> StoreResult<()> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;

        if task.status.is_terminal() {
            // A retried write of the same outcome already took effect.
            let same = task.status == outcome.status()
                && match outcome {
                    TaskOutcome::Success { output_ref } => {
                        task.output_ref.as_deref() == Some(output_ref.as_str())
                    }
                    TaskOutcome::Retryable { error } | TaskOutcome::Terminal { error } => {
                        task.error.as_ref() == Some(error)
                    }
                };
            if same {
                return Ok(());
            }
            return Err(StoreError::Conflict(format!(
                "task {task_id} already terminal ({})",
                task.status.as_str()
            )));
        }

        if task.lease_owner.as_deref() != Some(worker_id) {
            return Err(StoreError::LeaseLost {
                task_id,
                owner: worker_id.to_string(),
            });
        }

        task.status = outcome.status();
        match outcome {
            TaskOutcome::Success { output_ref } => task.output_ref = Some(output_ref.clone()),
            TaskOutcome::Retryable { error } | TaskOutcome::Terminal { error } => {
                task.error = Some(error.clone())
            }
        }
        task.lease_owner = None;
        task.lease_expires_at = None;
        task.updated_at = now;
        Ok(())
    }

    async fn expire_leases(&self) -> StoreResult<u64> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let mut expired = 0;
        for task in inner.tasks.values_mut() {
            if matches!(task.status, TaskStatus::Leased | TaskStatus::Running)
                && task.lease_expires_at.map_or(false, |at| at < now)
            {
                task.status = TaskStatus::Pending;
                task.lease_owner = None;
                task.lease_expires_at = None;
                task.heartbeat_at = None;
                task.updated_at = now;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn escalate_retryable(&self, job_id: Uuid, phase: &str) -> StoreResult<u64> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let mut escalated = 0;
        for task in inner.tasks.values_mut() {
            if task.job_id == job_id
                && task.phase == phase
                && task.status == TaskStatus::FailedRetryable
            {
                task.status = TaskStatus::FailedTerminal;
                task.updated_at = now;
                escalated += 1;
            }
        }
        Ok(escalated)
    }

    async fn cancel_pending_tasks(&self, job_id: Uuid) -> StoreResult<u64> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let mut cancelled = 0;
        for task in inner.tasks.values_mut() {
            if task.job_id == job_id && task.status == TaskStatus::Pending {
                task.status = TaskStatus::Cancelled;
                task.updated_at = now;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn count_tasks(&self, job_id: Uuid) -> StoreResult<TaskCounts> {
        let inner = self.lock();
        let mut map: HashMap<(crate::store::TaskRole, String, TaskStatus), i64> = HashMap::new();
        for task in inner.tasks.values().filter(|t| t.job_id == job_id) {
            *map.entry((task.role, task.phase.clone(), task.status))
                .or_insert(0) += 1;
        }
        let rows = map
            .into_iter()
            .map(|((role, phase, status), count)| TaskCountRow {
                role,
                phase,
                status,
                count,
            })
            .collect();
        Ok(TaskCounts { rows })
    }

    async fn queue_depth(&self) -> StoreResult<i64> {
        let now = self.clock.now();
        let inner = self.lock();
        Ok(inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.run_at <= now
                    && inner.job_accepts_leases(t.job_id)
            })
            .count() as i64)
    }

    async fn acquire_job_lock(
        &self,
        job_id: Uuid,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let held_by_other = inner
            .job_locks
            .get(&job_id)
            .map_or(false, |(holder, expires)| holder != owner && *expires >= now);
        if held_by_other {
            return Ok(false);
        }
        inner
            .job_locks
            .insert(job_id, (owner.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_job_lock(&self, job_id: Uuid, owner: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner
            .job_locks
            .get(&job_id)
            .map_or(false, |(holder, _)| holder == owner)
        {
            inner.job_locks.remove(&job_id);
        }
        Ok(())
    }

    async fn load_bucket(&self, key: &str) -> StoreResult<Option<TokenBucket>> {
        Ok(self.lock().buckets.get(key).cloned())
    }

    async fn store_bucket(
        &self,
        key: &str,
        expected_version: i64,
        bucket: &TokenBucket,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        let current_version = inner.buckets.get(key).map(|b| b.version);
        let matches = match current_version {
            None => expected_version == 0,
            Some(version) => version == expected_version,
        };
        if !matches {
            return Ok(false);
        }
        inner.buckets.insert(key.to_string(), bucket.clone());
        Ok(true)
    }
}
