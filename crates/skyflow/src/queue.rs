use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

use crate::metrics::RuntimeMetrics;
use crate::store::{StateStore, StoreError, StoreResult, Task, TaskError, TaskOutcome};

/// Durable work queue over the state store.
///
/// The tasks table is the queue: `dequeue` atomically pops runnable tasks and
/// leases them to the caller, so a delivered task is always owned. Delivery is
/// at-least-once; duplicate creation is suppressed by the task identity key.
#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn StateStore>,
    metrics: Arc<RuntimeMetrics>,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn StateStore>, metrics: Arc<RuntimeMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Enqueue tasks. A task whose `(job_id, batch_id, attempt)` identity
    /// already exists is skipped (idempotent re-enqueue across coordinator
    /// restarts). Returns how many were newly created.
    pub async fn enqueue(&self, tasks: &[Task]) -> StoreResult<usize> {
        let mut created = 0;
        for task in tasks {
            match self.store.create_task(task).await {
                Ok(()) => created += 1,
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    /// Pop up to `max_n` tasks, leased to `worker_id` for `lease`.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        max_n: usize,
        lease: Duration,
    ) -> StoreResult<Vec<Task>> {
        let (tasks, reclaimed) = self.store.lease_ready_tasks(worker_id, max_n, lease).await?;
        RuntimeMetrics::add(&self.metrics.leases_acquired, tasks.len() as i64);
        RuntimeMetrics::add(&self.metrics.leases_reclaimed, reclaimed as i64);
        Ok(tasks)
    }

    pub async fn ack(&self, task_id: Uuid, worker_id: &str, output_ref: String) -> StoreResult<()> {
        self.store
            .complete_task(task_id, worker_id, &TaskOutcome::Success { output_ref })
            .await?;
        RuntimeMetrics::inc(&self.metrics.tasks_succeeded);
        Ok(())
    }

    pub async fn nack(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: TaskError,
        retryable: bool,
    ) -> StoreResult<()> {
        let outcome = if retryable {
            TaskOutcome::Retryable { error }
        } else {
            TaskOutcome::Terminal { error }
        };
        self.store.complete_task(task_id, worker_id, &outcome).await?;
        if retryable {
            RuntimeMetrics::inc(&self.metrics.tasks_failed_retryable);
        } else {
            RuntimeMetrics::inc(&self.metrics.tasks_failed_terminal);
        }
        Ok(())
    }

    pub async fn depth(&self) -> StoreResult<i64> {
        self.store.queue_depth().await
    }
}
