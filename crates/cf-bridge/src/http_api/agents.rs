use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use cf_core::types::Id;

use super::state::ApiState;
use super::types::{parse_range_hours, EventsQuery, MetricsQuery};
use crate::api_error::ApiError;

/// GET /api/projects/{id}/agents — the project's agent roster with status,
/// current task, heartbeat, and usage totals.
pub(crate) async fn list_agents(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_project(id).await?;
    let agents = state.store.list_agents(id).await?;
    Ok(Json(serde_json::json!({ "agents": agents })))
}

/// GET /api/projects/{id}/metrics?range= — aggregated cost and token
/// usage, by agent and by model, with an hourly trend.
pub(crate) async fn get_metrics(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
    Query(query): Query<MetricsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_project(id).await?;
    let range_hours = match query.range.as_deref() {
        Some(raw) => Some(
            parse_range_hours(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unrecognized range '{}'", raw)))?,
        ),
        None => None,
    };
    let summary = state.store.metrics(id, range_hours).await?;
    Ok(Json(serde_json::json!({
        "cost_total_cents": summary.cost_total_cents,
        "tokens": { "in": summary.tokens_in, "out": summary.tokens_out },
        "by_agent": summary.by_agent,
        "by_model": summary.by_model,
        "trend": summary.trend,
    })))
}

/// GET /api/projects/{id}/events?limit= — recent audit events. A query
/// endpoint over the append-only log, not a replay channel.
pub(crate) async fn recent_events(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Id>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_project(id).await?;
    let limit = query.limit.unwrap_or(100).min(1000);
    let events = state.store.recent_events(id, limit).await?;
    Ok(Json(serde_json::json!({ "events": events })))
}
