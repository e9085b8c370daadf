//! VM and snapshot handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{ListSnapshotsResponse, ListVmsResponse, StopQuery};
use crate::vm::{Snapshot, SnapshotParams, VmInfo, VmParams};

/// GET /api/v1/vms - List VMs.
pub async fn list_vms(State(state): State<Arc<ApiState>>) -> Result<Json<ListVmsResponse>, ApiError> {
    let vms = state.vms.list().await?;
    Ok(Json(ListVmsResponse { vms }))
}

/// POST /api/v1/vms - Create and start a VM.
pub async fn create_vm(
    State(state): State<Arc<ApiState>>,
    Json(params): Json<VmParams>,
) -> Result<(StatusCode, Json<VmInfo>), ApiError> {
    tracing::info!(vm_name = %params.name, "create vm requested");
    let vm = state.vms.create(params).await?;
    Ok((StatusCode::CREATED, Json(vm)))
}

/// GET /api/v1/vms/:name - Get a VM.
pub async fn get_vm(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<VmInfo>, ApiError> {
    Ok(Json(state.vms.get(&name).await?))
}

/// DELETE /api/v1/vms/:name - Delete a VM and its storage.
pub async fn delete_vm(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.vms.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/vms/:name/start - Start a VM.
pub async fn start_vm(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<VmInfo>, ApiError> {
    state.vms.start(&name).await?;
    Ok(Json(state.vms.get(&name).await?))
}

/// POST /api/v1/vms/:name/stop - Stop a VM, forcibly with `?force=true`.
pub async fn stop_vm(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<Json<VmInfo>, ApiError> {
    if query.force {
        state.vms.force_stop(&name).await?;
    } else {
        state.vms.stop(&name).await?;
    }
    Ok(Json(state.vms.get(&name).await?))
}

/// POST /api/v1/vms/:name/restart - Restart a VM.
pub async fn restart_vm(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<VmInfo>, ApiError> {
    state.vms.restart(&name).await?;
    Ok(Json(state.vms.get(&name).await?))
}

/// GET /api/v1/vms/:name/snapshots - List snapshots.
pub async fn list_snapshots(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<ListSnapshotsResponse>, ApiError> {
    let snapshots = state.vms.list_snapshots(&name).await?;
    Ok(Json(ListSnapshotsResponse { snapshots }))
}

/// POST /api/v1/vms/:name/snapshots - Create a snapshot.
pub async fn create_snapshot(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(params): Json<SnapshotParams>,
) -> Result<(StatusCode, Json<Snapshot>), ApiError> {
    let snapshot = state.vms.create_snapshot(&name, &params).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// GET /api/v1/vms/:name/snapshots/:snapshot - Get a snapshot.
pub async fn get_snapshot(
    State(state): State<Arc<ApiState>>,
    Path((name, snapshot)): Path<(String, String)>,
) -> Result<Json<Snapshot>, ApiError> {
    Ok(Json(state.vms.get_snapshot(&name, &snapshot).await?))
}

/// DELETE /api/v1/vms/:name/snapshots/:snapshot - Delete a snapshot.
pub async fn delete_snapshot(
    State(state): State<Arc<ApiState>>,
    Path((name, snapshot)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.vms.delete_snapshot(&name, &snapshot).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/vms/:name/snapshots/:snapshot/revert - Revert to a snapshot.
pub async fn revert_snapshot(
    State(state): State<Arc<ApiState>>,
    Path((name, snapshot)): Path<(String, String)>,
) -> Result<Json<Snapshot>, ApiError> {
    state.vms.revert_snapshot(&name, &snapshot).await?;
    Ok(Json(state.vms.get_snapshot(&name, &snapshot).await?))
}
