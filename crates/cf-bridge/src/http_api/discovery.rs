use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use cf_core::types::{Id, ProjectPhase};

use super::state::ApiState;
use super::types::{
    AnswerRequest, ApiJson, CurrentQuestion, DiscoveryProgressResponse, DiscoverySummary,
    PrdSummary,
};
use crate::api_error::ApiError;

/// GET /api/projects/{id}/discovery/progress — the authoritative discovery
/// view clients reconcile against on mount. No event replay required.
pub(crate) async fn discovery_progress(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.store.get_project(id).await?;
    let discovery = state.store.discovery_state(id).await?;

    let current_question = discovery.pending_question().map(|q| CurrentQuestion {
        id: q.id,
        text: q.text.clone(),
    });
    let approved = matches!(
        project.phase,
        ProjectPhase::Active | ProjectPhase::Review | ProjectPhase::Complete
    );

    Ok(Json(DiscoveryProgressResponse {
        phase: project.phase,
        discovery: DiscoverySummary {
            state: discovery.state,
            current_question,
            questions_asked: discovery.questions.len(),
        },
        prd: PrdSummary {
            status: discovery.prd_status,
            url: None,
        },
        approved,
    }))
}

/// POST /api/projects/{id}/discovery/start — enter the discovery loop.
pub(crate) async fn start_discovery(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.start_discovery(id).await?;
    Ok(StatusCode::OK)
}

/// POST /api/projects/{id}/discovery/answer — answer the pending question.
/// Accepted only in the `discovery` phase with a question outstanding.
pub(crate) async fn answer_discovery(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
    ApiJson(req): ApiJson<AnswerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.answer_discovery(id, req.text).await?;
    Ok(StatusCode::OK)
}

/// POST /api/projects/{id}/discovery/generate-tasks — decompose the PRD in
/// the background. Accepted only in `planning`.
pub(crate) async fn generate_tasks(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.generate_tasks(id).await?;
    Ok(StatusCode::ACCEPTED)
}
