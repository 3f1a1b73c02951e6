use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;

use super::state::ApiState;

/// GET /health — liveness of the HTTP surface.
pub(crate) async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/status — daemon build and uptime summary.
pub(crate) async fn status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}
