use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub handler_ref: String,
    /// The submitted job spec, verbatim.
    pub config: Value,
    pub status: JobStatus,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Leases taken over from dead workers. The only counter stored on the
    /// job row; everything else derives from task rows.
    pub orphans_reclaimed: i64,
    pub failure: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Aggregating,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Aggregating => "aggregating",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "aggregating" => Some(JobStatus::Aggregating),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// User-visible reason for a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub phase_failed: String,
    pub retryable_count: i64,
    pub terminal_count: i64,
    pub first_error_sample: Option<TaskError>,
}

/// A read-only slice of input. Created exactly once per job; retries
/// reference the same batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub job_id: Uuid,
    pub seq: i32,
    pub input_ref: String,
    pub record_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRole {
    Worker,
    Aggregator,
    Coordinator,
}

impl TaskRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRole::Worker => "worker",
            TaskRole::Aggregator => "aggregator",
            TaskRole::Coordinator => "coordinator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "worker" => Some(TaskRole::Worker),
            "aggregator" => Some(TaskRole::Aggregator),
            "coordinator" => Some(TaskRole::Coordinator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Leased,
    Running,
    Success,
    FailedRetryable,
    FailedTerminal,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Leased => "leased",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::FailedRetryable => "failed_retryable",
            TaskStatus::FailedTerminal => "failed_terminal",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "leased" => Some(TaskStatus::Leased),
            "running" => Some(TaskStatus::Running),
            "success" => Some(TaskStatus::Success),
            "failed_retryable" => Some(TaskStatus::FailedRetryable),
            "failed_terminal" => Some(TaskStatus::FailedTerminal),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal for this attempt. `FailedRetryable` never runs again itself;
    /// the retry planner emits a fresh task with `attempt + 1`, or escalates
    /// it to `FailedTerminal` once the phase budget is spent.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success
                | TaskStatus::FailedRetryable
                | TaskStatus::FailedTerminal
                | TaskStatus::Cancelled
        )
    }

    /// Immutable once written.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::FailedTerminal | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    pub retries_so_far: i32,
}

/// One execution attempt against one batch.
///
/// Identity is `(job_id, batch_id, attempt)`. Aggregator tasks use the job id
/// as their batch id, which keeps identity unique per job and makes
/// re-creation after a coordinator restart idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub batch_id: Uuid,
    pub role: TaskRole,
    pub phase: String,
    pub attempt: i32,
    pub status: TaskStatus,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub output_ref: Option<String>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        job_id: Uuid,
        batch_id: Uuid,
        role: TaskRole,
        phase: impl Into<String>,
        attempt: i32,
        priority: i32,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            batch_id,
            role,
            phase: phase.into(),
            attempt,
            status: TaskStatus::Pending,
            priority,
            run_at,
            lease_owner: None,
            lease_expires_at: None,
            heartbeat_at: None,
            output_ref: None,
            error: None,
            created_at: run_at,
            updated_at: run_at,
        }
    }
}

/// Terminal result a worker commits under its lease.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success { output_ref: String },
    Retryable { error: TaskError },
    Terminal { error: TaskError },
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Success { .. } => TaskStatus::Success,
            TaskOutcome::Retryable { .. } => TaskStatus::FailedRetryable,
            TaskOutcome::Terminal { .. } => TaskStatus::FailedTerminal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Ok,
    Lost,
    /// The owning job was cancelled; the worker must stop and nack terminally.
    Cancelled,
}

/// Shared token bucket state, one row per `(endpoint, credential)`.
/// Mutated only through compare-and-swap on `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub available: f64,
    pub last_refill_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
}

/// Task counts grouped by role, phase, and status. Derived from task rows on
/// demand; never stored.
#[derive(Debug, Clone, Default)]
pub struct TaskCounts {
    pub rows: Vec<TaskCountRow>,
}

#[derive(Debug, Clone)]
pub struct TaskCountRow {
    pub role: TaskRole,
    pub phase: String,
    pub status: TaskStatus,
    pub count: i64,
}

impl TaskCounts {
    pub fn total(&self, role: TaskRole, status: TaskStatus) -> i64 {
        self.rows
            .iter()
            .filter(|r| r.role == role && r.status == status)
            .map(|r| r.count)
            .sum()
    }

    pub fn total_role(&self, role: TaskRole) -> i64 {
        self.rows
            .iter()
            .filter(|r| r.role == role)
            .map(|r| r.count)
            .sum()
    }

    pub fn non_terminal(&self, role: TaskRole) -> i64 {
        self.rows
            .iter()
            .filter(|r| r.role == role && !r.status.is_terminal())
            .map(|r| r.count)
            .sum()
    }

    pub fn by_status(&self) -> HashMap<TaskStatus, i64> {
        let mut out = HashMap::new();
        for r in &self.rows {
            *out.entry(r.status).or_insert(0) += r.count;
        }
        out
    }

    pub fn by_phase(&self) -> HashMap<String, HashMap<TaskStatus, i64>> {
        let mut out: HashMap<String, HashMap<TaskStatus, i64>> = HashMap::new();
        for r in &self.rows {
            *out.entry(r.phase.clone())
                .or_default()
                .entry(r.status)
                .or_insert(0) += r.count;
        }
        out
    }
}
