//! Export job handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::ListJobsResponse;
use crate::export::{ExportRequest, Job};

/// POST /api/v1/vms/:name/export - Start an export job.
///
/// Returns as soon as the job is scheduled; poll the job for progress.
pub async fn create_export(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(request): Json<ExportRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state.exports.create_export_job(&name, request).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// GET /api/v1/exports - List export jobs, newest first.
pub async fn list_exports(State(state): State<Arc<ApiState>>) -> Json<ListJobsResponse> {
    let mut jobs = state.exports.list_jobs();
    jobs.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| a.id.cmp(&b.id)));
    Json(ListJobsResponse { jobs })
}

/// GET /api/v1/exports/:id - Get an export job.
pub async fn get_export(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.exports.get_job(&id)?))
}

/// DELETE /api/v1/exports/:id - Cancel an export job.
pub async fn cancel_export(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.exports.cancel_job(&id)?))
}
