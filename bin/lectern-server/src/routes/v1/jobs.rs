//! Job polling, listing, cancellation and acknowledgement.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use lectern_core::{BackendClass, JobFilter, JobId, JobKind, JobStatus};
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::v1::jobs::{JobQuery, JobResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(list_jobs, get_job, cancel_job, delete_job),
    components(schemas(JobResponse, JobQuery))
)]
pub struct JobsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job).delete(delete_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
}

fn parse_id(raw: &str) -> Result<JobId, ServerError> {
    raw.parse()
        .map_err(|_| ServerError::BadRequest(format!("invalid job id: {raw}")))
}

fn parse_filter(q: JobQuery) -> Result<JobFilter, ServerError> {
    let kind = q
        .kind
        .map(|k| k.parse::<JobKind>())
        .transpose()
        .map_err(|e| ServerError::BadRequest(format!("invalid kind: {e}")))?;
    let status = q
        .status
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(|e| ServerError::BadRequest(format!("invalid status: {e}")))?;
    Ok(JobFilter {
        kind,
        status,
        backend_class: q.backend_class.map(BackendClass::from),
    })
}

#[utoipa::path(
    get,
    path = "/v1/jobs",
    tag = "jobs",
    params(JobQuery),
    responses(
        (status = 200, description = "Jobs listed, oldest first", body = [JobResponse]),
        (status = 400, description = "Invalid filter"),
    )
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<JobQuery>,
) -> Result<Json<Vec<JobResponse>>, ServerError> {
    let filter = parse_filter(q)?;
    let jobs = state.dispatcher.list(&filter).await;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job snapshot", body = JobResponse),
        (status = 400, description = "Malformed id"),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ServerError> {
    let id = parse_id(&id)?;
    let job = state.dispatcher.poll(&id).await?;
    Ok(Json(job.into()))
}

#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/cancel",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job cancelled, or already finished", body = JobResponse),
        (status = 404, description = "Job not found"),
    )
)]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ServerError> {
    let id = parse_id(&id)?;
    let job = state.dispatcher.cancel(&id).await?;
    info!(job_id = %id, status = %job.status, "cancel requested");
    Ok(Json(job.into()))
}

/// Evict a finished job.
#[utoipa::path(
    delete,
    path = "/v1/jobs/{id}",
    tag = "jobs",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "Final snapshot of the evicted job", body = JobResponse),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job has not finished"),
    )
)]
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ServerError> {
    let id = parse_id(&id)?;
    let job = state.dispatcher.acknowledge(&id).await?;
    Ok(Json(job.into()))
}
