//! Operator read surface: health for the load balancer, stats and per-job
//! status for humans. Everything returned here has passed through redaction;
//! the raw row never leaves the process.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use bisectd::job::Job;
use bisectd::security::redact;
use bisectd::store::JobStore;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub worker_id: String,
    pub running_jobs: i64,
    pub max_concurrent_jobs: u32,
}

pub async fn health<S: JobStore + Clone + Send + Sync + 'static>(
    State(state): State<AppState<S>>,
) -> Json<HealthResponse> {
    let sandbox_ok = state.sandbox.available().await;
    let store_result = state.store.ping().await;
    let running_jobs = state
        .store
        .owned_running(&state.worker)
        .await
        .unwrap_or_default();

    let reason = match (&store_result, sandbox_ok) {
        (Err(err), _) => Some(format!("job store unreachable: {err}")),
        (Ok(()), false) => Some("sandbox runtime unavailable".to_owned()),
        (Ok(()), true) => None,
    };

    Json(HealthResponse {
        status: if reason.is_none() { "healthy" } else { "degraded" },
        reason,
        worker_id: state.worker.to_string(),
        running_jobs,
        max_concurrent_jobs: state.max_concurrent_jobs,
    })
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub running_on_this_instance: i64,
}

pub async fn stats<S: JobStore + Clone + Send + Sync + 'static>(
    State(state): State<AppState<S>>,
) -> Result<Json<StatsResponse>, StatusCode> {
    let counts = state
        .store
        .counts()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let owned = state
        .store
        .owned_running(&state.worker)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(StatsResponse {
        pending: counts.pending,
        running: counts.running,
        completed: counts.completed,
        failed: counts.failed,
        cancelled: counts.cancelled,
        running_on_this_instance: owned,
    }))
}

/// The job row as shown to operators. Free-text fields are redacted once
/// more on the way out; identifiers are passed through.
#[derive(Serialize)]
pub struct JobView {
    pub id: i64,
    pub status: String,
    pub repo: String,
    pub requester: String,
    pub good_sha: String,
    pub bad_sha: String,
    pub test_command: String,
    pub culprit_sha: Option<String>,
    pub error_message: Option<String>,
    pub progress_log: String,
    pub worker_id: Option<String>,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id.into(),
            status: job.status.to_string(),
            repo: job.repo_slug(),
            requester: job.requester.clone(),
            good_sha: job.good_sha.clone(),
            bad_sha: job.bad_sha.clone(),
            test_command: redact(&job.test_command),
            culprit_sha: job.culprit_sha.clone(),
            error_message: job.error_message.as_deref().map(redact),
            progress_log: redact(&job.progress_log),
            worker_id: job.worker_id.as_ref().map(ToString::to_string),
            attempt_count: job.attempt_count,
            created_at: job.created_at,
            started_at: job.started_at,
            heartbeat_at: job.heartbeat_at,
            finished_at: job.finished_at,
        }
    }
}

pub async fn job<S: JobStore + Clone + Send + Sync + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<i64>,
) -> Result<Json<JobView>, StatusCode> {
    match state.store.get(id.into()).await {
        Ok(Some(job)) => Ok(Json(job.into())),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}
