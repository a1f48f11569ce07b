use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::artifact::ArtifactStore;
use crate::checkpoint::CheckpointHandle;
use crate::config::JobSpec;
use crate::context::RuntimeContext;
use crate::ratelimit::RateLimitManager;
use crate::retry::ErrorKind;
use crate::store::{Batch, Job, Task, TaskError};

/// Handler result sum type. Classification is an explicit match at the call
/// site, not an inspection of whatever was thrown.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{kind}: {message} (retryable)")]
    Retryable { kind: String, message: String },
    #[error("{kind}: {message}")]
    Terminal { kind: String, message: String },
}

impl HandlerError {
    pub fn retryable(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Retryable {
            kind: kind.as_str().to_string(),
            message: message.into(),
        }
    }

    pub fn terminal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Terminal {
            kind: kind.as_str().to_string(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub fn to_task_error(&self, retries_so_far: i32) -> TaskError {
        let (kind, message) = match self {
            Self::Retryable { kind, message } | Self::Terminal { kind, message } => {
                (kind.clone(), message.clone())
            }
        };
        TaskError {
            kind,
            message,
            retries_so_far,
        }
    }
}

/// What a partitioner emits before batches get ids.
#[derive(Debug, Clone)]
pub struct BatchSeed {
    pub seq: i32,
    pub input_ref: String,
    pub record_count: i64,
}

/// Per-task log sink: one file per task under the artifact root, mirrored to
/// tracing.
#[derive(Clone)]
pub struct TaskLogger {
    artifacts: ArtifactStore,
    job_id: Uuid,
    task_id: Uuid,
}

impl TaskLogger {
    pub fn new(artifacts: ArtifactStore, job_id: Uuid, task_id: Uuid) -> Self {
        Self {
            artifacts,
            job_id,
            task_id,
        }
    }

    pub async fn log(&self, line: &str) {
        tracing::info!(job_id = %self.job_id, task_id = %self.task_id, "{line}");
        if let Err(e) = self.artifacts.append_log(self.job_id, self.task_id, line).await {
            tracing::warn!(task_id = %self.task_id, "task log write failed: {e}");
        }
    }
}

/// Everything a handler gets for one task execution.
pub struct TaskCtx {
    pub task: Task,
    /// None for aggregator-role tasks.
    pub batch: Option<Batch>,
    pub job: Job,
    pub spec: JobSpec,
    pub limiter: Arc<RateLimitManager>,
    pub checkpoint: CheckpointHandle,
    pub artifacts: ArtifactStore,
    pub logger: TaskLogger,
}

impl TaskCtx {
    pub fn batch(&self) -> Result<&Batch, HandlerError> {
        self.batch.as_ref().ok_or_else(|| {
            HandlerError::terminal(ErrorKind::HandlerFailure, "task carries no batch")
        })
    }
}

/// The extension point. Handlers are pure `(input_ref, config) -> output_ref`
/// with side effects limited to rate-limited I/O and checkpoint writes.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    fn output_ext(&self) -> &'static str {
        "jsonl"
    }

    /// Whether aggregation may drop the batch ordering.
    fn unordered_reduce(&self) -> bool {
        false
    }

    /// Slice the job input into batches. The default defers to the
    /// partitioner selected by `input.type`.
    async fn partition(
        &self,
        ctx: &RuntimeContext,
        job: &Job,
        spec: &JobSpec,
    ) -> Result<Vec<BatchSeed>, HandlerError> {
        crate::partition::plan(ctx, job, spec).await
    }

    /// Execute one batch; returns the output artifact uri (with its `.done`
    /// marker already written).
    async fn run(&self, ctx: &TaskCtx) -> Result<String, HandlerError>;
}

/// Name -> handler map, built once at startup and looked up at submission
/// and execution time.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, handler_ref: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(handler_ref).cloned()
    }

    pub fn contains(&self, handler_ref: &str) -> bool {
        self.handlers.contains_key(handler_ref)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
