use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::JobSpec;
use crate::context::RuntimeContext;
use crate::coordinator::{Coordinator, SubmitError};
use crate::metrics::MetricsSnapshot;
use crate::store::{Job, JobFailure, JobFilter, JobStatus, StateStore, Task, TaskStatus};

#[derive(Clone)]
pub struct ApiState {
    pub ctx: RuntimeContext,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        // Jobs
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/tasks", get(job_tasks))
        .route("/jobs/:id/cancel", post(cancel_job))
        // Metrics
        .route("/metrics", get(metrics))
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8" /><title>Skyflow Admin</title></head>
<body>
  <h1>Skyflow Admin</h1>
  <p>Endpoints: GET /jobs, POST /jobs, GET /jobs/:id, GET /jobs/:id/tasks,
     POST /jobs/:id/cancel, GET /metrics, GET /metrics/prom, GET /health</p>
</body>
</html>
"#;

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ----------------------------
// Views
// ----------------------------

#[derive(Debug, Serialize)]
struct JobSummary {
    id: Uuid,
    name: String,
    handler_ref: String,
    status: &'static str,
    submitted_by: String,
    submitted_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    orphans_reclaimed: i64,
    failure: Option<JobFailure>,
}

impl JobSummary {
    fn from_job(job: Job) -> Self {
        Self {
            id: job.id,
            name: job.name,
            handler_ref: job.handler_ref,
            status: job.status.as_str(),
            submitted_by: job.submitted_by,
            submitted_at: job.submitted_at,
            completed_at: job.completed_at,
            orphans_reclaimed: job.orphans_reclaimed,
            failure: job.failure,
        }
    }
}

#[derive(Debug, Serialize)]
struct JobDetail {
    #[serde(flatten)]
    summary: JobSummary,
    status_counts: HashMap<String, i64>,
    phase_counts: HashMap<String, HashMap<String, i64>>,
}

#[derive(Debug, Serialize)]
struct TaskView {
    id: Uuid,
    batch_id: Uuid,
    role: &'static str,
    phase: String,
    attempt: i32,
    status: &'static str,
    priority: i32,
    lease_owner: Option<String>,
    output_ref: Option<String>,
    error: Option<crate::store::TaskError>,
    updated_at: DateTime<Utc>,
}

impl TaskView {
    fn from_task(task: Task) -> Self {
        Self {
            id: task.id,
            batch_id: task.batch_id,
            role: task.role.as_str(),
            phase: task.phase,
            attempt: task.attempt,
            status: task.status.as_str(),
            priority: task.priority,
            lease_owner: task.lease_owner,
            output_ref: task.output_ref,
            error: task.error,
            updated_at: task.updated_at,
        }
    }
}

// ----------------------------
// Handlers
// ----------------------------

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
    limit: Option<i64>,
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobSummary>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            JobStatus::parse(s).ok_or((StatusCode::BAD_REQUEST, format!("bad status {s:?}")))?,
        ),
        None => None,
    };
    let jobs = state
        .ctx
        .store
        .list_jobs(&JobFilter {
            status,
            limit: query.limit,
        })
        .await
        .map_err(internal)?;
    Ok(Json(jobs.into_iter().map(JobSummary::from_job).collect()))
}

async fn submit_job(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let spec = JobSpec::from_value(&body).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    match Coordinator::submit(&state.ctx, spec, "api").await {
        Ok(job_id) => Ok((
            StatusCode::CREATED,
            Json(serde_json::json!({ "job_id": job_id })),
        )),
        Err(SubmitError::InvalidConfig(e)) => Err((StatusCode::BAD_REQUEST, e)),
        Err(SubmitError::UnknownHandler(h)) => Err((
            StatusCode::BAD_REQUEST,
            format!("unknown handler {h}"),
        )),
        Err(e) => Err(internal(e)),
    }
}

async fn job_status(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobDetail>, ApiError> {
    let job = state
        .ctx
        .store
        .get_job(id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, format!("job {id} not found")))?;
    let counts = state.ctx.store.count_tasks(id).await.map_err(internal)?;

    let status_counts = counts
        .by_status()
        .into_iter()
        .map(|(status, n)| (status.as_str().to_string(), n))
        .collect();
    let phase_counts = counts
        .by_phase()
        .into_iter()
        .map(|(phase, statuses)| {
            (
                phase,
                statuses
                    .into_iter()
                    .map(|(status, n)| (status.as_str().to_string(), n))
                    .collect(),
            )
        })
        .collect();

    Ok(Json(JobDetail {
        summary: JobSummary::from_job(job),
        status_counts,
        phase_counts,
    }))
}

#[derive(Debug, Deserialize)]
struct TasksQuery {
    status: Option<String>,
}

async fn job_tasks(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TasksQuery>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            TaskStatus::parse(s).ok_or((StatusCode::BAD_REQUEST, format!("bad status {s:?}")))?,
        ),
        None => None,
    };
    if state
        .ctx
        .store
        .get_job(id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err((StatusCode::NOT_FOUND, format!("job {id} not found")));
    }
    let tasks = state
        .ctx
        .store
        .list_tasks(id, status)
        .await
        .map_err(internal)?;
    Ok(Json(tasks.into_iter().map(TaskView::from_task).collect()))
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    if state
        .ctx
        .store
        .get_job(id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err((StatusCode::NOT_FOUND, format!("job {id} not found")));
    }
    let cancelled = Coordinator::cancel(&state.ctx, id).await.map_err(internal)?;
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

async fn snapshot(state: &ApiState) -> Result<MetricsSnapshot, ApiError> {
    let depth = state.ctx.queue.depth().await.map_err(internal)?;
    Ok(state.ctx.metrics.snapshot(depth, state.ctx.clock.now()))
}

async fn metrics(State(state): State<ApiState>) -> Result<Json<MetricsSnapshot>, ApiError> {
    Ok(Json(snapshot(&state).await?))
}

async fn metrics_prom(State(state): State<ApiState>) -> Result<String, ApiError> {
    Ok(snapshot(&state).await?.to_prometheus())
}
