//! Job API Handlers
//!
//! Producer and operational endpoints for pipeline jobs.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use quill_core::domain::job::{Job, JobKind, JobStatus};
use quill_core::dto::job::{EnqueueJob, JobCounts, JobFilter, JobPage, Pagination, StatusOverride};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

/// POST /jobs
/// Enqueue a new pending job
pub async fn enqueue_job(
    State(state): State<AppState>,
    Json(req): Json<EnqueueJob>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let target_id = req.target_id.trim();
    if target_id.is_empty() {
        return Err(ApiError::BadRequest("target_id cannot be empty".to_string()));
    }

    let job = state.store.enqueue(req.kind, target_id).await?;
    tracing::info!("Enqueued {} job {} for {}", job.kind, job.id, job.target_id);

    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /jobs
/// List jobs, newest first
///
/// Query parameters:
/// - `status`, `kind`, `target_id` (optional): filters
/// - `limit` (optional, default 50, max 500), `offset` (optional)
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsQuery>,
) -> ApiResult<Json<JobPage>> {
    let filter = JobFilter {
        status: params.status,
        target_id: params.target_id,
        kind: params.kind,
    };
    let pagination = Pagination::new(params.limit, params.offset);
    tracing::debug!("Listing jobs: {:?} {:?}", filter, pagination);

    let page = state.store.list(&filter, pagination).await?;
    Ok(Json(page))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub target_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// GET /jobs/{id}
pub async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Job>> {
    tracing::debug!("Getting job: {}", id);

    let job = state
        .store
        .find_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", id)))?;

    Ok(Json(job))
}

/// GET /jobs/stats
/// Job counts per status
pub async fn job_stats(State(state): State<AppState>) -> ApiResult<Json<JobCounts>> {
    let counts = state.store.counts().await?;
    Ok(Json(counts))
}

/// POST /jobs/{id}/override
/// Force a job to pending, paused or failed
///
/// Any dispatcher still running the job loses its claim. Completed jobs are
/// refused with 409 Conflict.
pub async fn override_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusOverride>,
) -> ApiResult<Json<Job>> {
    tracing::warn!("Administrative override of job {} to {:?}", id, req.status);

    let job = state.store.override_status(id, &req).await?;
    Ok(Json(job))
}
