use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use cf_core::types::Id;

use super::state::ApiState;
use crate::api_error::ApiError;

/// POST /api/projects/{id}/session/start
pub(crate) async fn start_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.orchestrator.start_session(id).await?;
    Ok(Json(session))
}

/// POST /api/projects/{id}/session/pause
pub(crate) async fn pause_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.pause_session(id).await?;
    Ok(Json(serde_json::json!({ "status": "paused" })))
}

/// POST /api/projects/{id}/session/resume
pub(crate) async fn resume_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.resume_session(id).await?;
    Ok(Json(serde_json::json!({ "status": "active" })))
}

/// POST /api/projects/{id}/session/stop
pub(crate) async fn stop_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.stop_session(id).await?;
    Ok(Json(serde_json::json!({ "status": "stopped" })))
}
