use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use cf_core::types::Id;

use super::state::ApiState;
use super::types::{ApiJson, CreateProjectRequest};
use crate::api_error::ApiError;
use crate::orchestrator::CreateProject;

/// POST /api/projects — create a project and provision its workspace.
pub(crate) async fn create_project(
    State(state): State<Arc<ApiState>>,
    ApiJson(req): ApiJson<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .orchestrator
        .create_project(CreateProject {
            name: req.name,
            description: req.description,
            source_type: req.source_type,
            source_location: req.source_location,
            source_branch: req.source_branch,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /api/projects — list all projects.
pub(crate) async fn list_projects(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let projects = state.store.list_projects().await?;
    Ok(Json(serde_json::json!({ "projects": projects })))
}

/// GET /api/projects/{id} — fetch one project.
pub(crate) async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.store.get_project(id).await?;
    Ok(Json(project))
}

/// DELETE /api/projects/{id} — remove a project, its rows, and its
/// workspace. Refused while a session is live.
pub(crate) async fn delete_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.delete_project(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
