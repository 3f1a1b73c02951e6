//! Request and response bodies for the HTTP surface.
//!
//! Request DTOs reject unknown fields outright; body deserialization
//! failures surface as `422` with the serde reason in the details.

use axum::extract::{FromRequest, Request};
use serde::{Deserialize, Serialize};
use serde_json::json;

use cf_core::store::TaskComment;
use cf_core::types::{
    DiscoveryPhase, Id, PrdStatus, ProjectPhase, QualityFinding, SourceType, Task, TaskCounts,
};

use crate::api_error::ApiError;

// ---------------------------------------------------------------------------
// ApiJson — Json extractor with the uniform 422 error body
// ---------------------------------------------------------------------------

pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::Validation {
                message: "request body does not match the expected schema".into(),
                details: Some(json!({ "reason": rejection.body_text() })),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub source_location: Option<String>,
    #[serde(default)]
    pub source_branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnswerRequest {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApproveRequest {
    pub approved: bool,
    #[serde(default)]
    pub excluded_task_ids: Vec<Id>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnblockRequest {
    pub guidance: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateCheckpointRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsQuery {
    #[serde(default)]
    pub range: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub project_id: Id,
    #[serde(default)]
    pub token: Option<String>,
}

/// Parse a metrics range like `24h`, `7d`, or a bare hour count.
pub fn parse_range_hours(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if let Some(hours) = raw.strip_suffix('h') {
        return hours.parse().ok();
    }
    if let Some(days) = raw.strip_suffix('d') {
        return days.parse::<u32>().ok().map(|d| d.saturating_mul(24));
    }
    raw.parse().ok()
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DiscoveryProgressResponse {
    pub phase: ProjectPhase,
    pub discovery: DiscoverySummary,
    pub prd: PrdSummary,
    /// Whether the decomposition has been approved (project reached
    /// `active` or later).
    pub approved: bool,
}

#[derive(Debug, Serialize)]
pub struct DiscoverySummary {
    pub state: DiscoveryPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_question: Option<CurrentQuestion>,
    pub questions_asked: usize,
}

#[derive(Debug, Serialize)]
pub struct CurrentQuestion {
    pub id: Id,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct PrdSummary {
    pub status: PrdStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
    pub total: u64,
    pub counts: TaskCounts,
}

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: Task,
    pub findings: Vec<QualityFinding>,
    pub comments: Vec<TaskComment>,
}

#[derive(Debug, Serialize)]
pub struct ApproveResponse {
    pub success: bool,
    pub phase: ProjectPhase,
    pub approved_count: usize,
    pub excluded_count: usize,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
