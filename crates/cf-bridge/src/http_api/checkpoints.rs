use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use cf_core::types::Id;

use super::state::ApiState;
use super::types::{ApiJson, CreateCheckpointRequest};
use crate::api_error::ApiError;

/// POST /api/projects/{id}/checkpoints — snapshot the workspace under a
/// unique name.
pub(crate) async fn create_checkpoint(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
    ApiJson(req): ApiJson<CreateCheckpointRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::validation("checkpoint name must not be empty"));
    }
    let checkpoint = state
        .checkpoints
        .create(id, &req.name, req.description)
        .await?;
    Ok((StatusCode::CREATED, Json(checkpoint)))
}

/// GET /api/projects/{id}/checkpoints — list the project's checkpoints.
pub(crate) async fn list_checkpoints(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_project(id).await?;
    let checkpoints = state.checkpoints.list(id).await?;
    Ok(Json(serde_json::json!({ "checkpoints": checkpoints })))
}

/// GET /api/projects/{id}/checkpoints/{checkpoint_id}/diff — unified diff
/// between the checkpoint and the current working tree.
pub(crate) async fn diff_checkpoint(
    State(state): State<Arc<ApiState>>,
    Path((id, checkpoint_id)): Path<(Id, Id)>,
) -> Result<impl IntoResponse, ApiError> {
    let diff = state.checkpoints.diff(id, checkpoint_id).await?;
    Ok(Json(serde_json::json!({ "diff": diff })))
}

/// POST /api/projects/{id}/checkpoints/{checkpoint_id}/restore — reset the
/// working tree to the checkpoint. `409` while a session is live.
pub(crate) async fn restore_checkpoint(
    State(state): State<Arc<ApiState>>,
    Path((id, checkpoint_id)): Path<(Id, Id)>,
) -> Result<impl IntoResponse, ApiError> {
    state.checkpoints.restore(id, checkpoint_id).await?;
    Ok(StatusCode::OK)
}

/// DELETE /api/projects/{id}/checkpoints/{checkpoint_id} — drop the
/// checkpoint row (the git objects stay in the workspace's object store).
pub(crate) async fn delete_checkpoint(
    State(state): State<Arc<ApiState>>,
    Path((id, checkpoint_id)): Path<(Id, Id)>,
) -> Result<impl IntoResponse, ApiError> {
    let checkpoint = state.store.get_checkpoint(checkpoint_id).await?;
    if checkpoint.project_id != id {
        return Err(ApiError::NotFound(format!("checkpoint {}", checkpoint_id)));
    }
    state.store.delete_checkpoint(checkpoint_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
