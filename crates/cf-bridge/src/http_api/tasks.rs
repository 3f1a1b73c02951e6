use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use cf_core::types::Id;

use super::state::ApiState;
use super::types::{
    ApiJson, ApproveRequest, ApproveResponse, TaskDetailResponse, TaskListResponse,
    UnblockRequest,
};
use crate::api_error::ApiError;

/// GET /api/projects/{id}/tasks — the full task list with per-status
/// counts. This is the late joiner's authoritative view.
pub(crate) async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    // surfaces NotFound for unknown projects before returning an empty list
    state.store.get_project(id).await?;
    let tasks = state.store.list_tasks(id).await?;
    let counts = state.store.task_counts(id).await?;
    Ok(Json(TaskListResponse {
        total: counts.total(),
        tasks,
        counts,
    }))
}

/// GET /api/projects/{id}/tasks/{task_id} — one task with its findings and
/// operator comments.
pub(crate) async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path((id, task_id)): Path<(Id, Id)>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.store.get_task(task_id).await?;
    if task.project_id != id {
        return Err(ApiError::NotFound(format!("task {}", task_id)));
    }
    let findings = state.store.list_findings(task_id).await?;
    let comments = state.store.list_task_comments(task_id).await?;
    Ok(Json(TaskDetailResponse {
        task,
        findings,
        comments,
    }))
}

/// POST /api/projects/{id}/tasks/approve — approve the decomposition and
/// ignite the execution loop. Accepted only in `planning`; idempotent once
/// `active`.
pub(crate) async fn approve_tasks(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
    ApiJson(req): ApiJson<ApproveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .orchestrator
        .approve_tasks(id, req.approved, req.excluded_task_ids)
        .await?;
    let message = if outcome.already_approved {
        "AlreadyApproved".to_string()
    } else if req.approved {
        format!(
            "{} task(s) ready, {} excluded",
            outcome.approved_count, outcome.excluded_count
        )
    } else {
        "decomposition left unapproved".to_string()
    };
    Ok(Json(ApproveResponse {
        success: req.approved && !outcome.already_approved,
        phase: outcome.phase,
        approved_count: outcome.approved_count,
        excluded_count: outcome.excluded_count,
        message,
    }))
}

/// POST /api/projects/{id}/tasks/{task_id}/unblock — record guidance and
/// return a blocked task to ready. Accepted only in `active`.
pub(crate) async fn unblock_task(
    State(state): State<Arc<ApiState>>,
    Path((id, task_id)): Path<(Id, Id)>,
    ApiJson(req): ApiJson<UnblockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .orchestrator
        .unblock_task(id, task_id, req.guidance)
        .await?;
    Ok(StatusCode::OK)
}
