// ---------------------------------------------------------------------------
// HTTP API module directory
// ---------------------------------------------------------------------------
//
// Domain-oriented handler modules wired together by the router below.
// Queries read the store; commands cross the orchestrator seam; the
// websocket module owns the push channel.

mod agents;
mod checkpoints;
mod discovery;
mod misc;
mod projects;
mod session;
mod tasks;
pub mod state;
pub mod types;
mod websocket;

pub use state::ApiState;

use std::sync::Arc;

use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::auth::AuthLayer;
use cf_telemetry::middleware::request_log_middleware;

/// Build the full API router. Auth comes from the verifier held in
/// [`ApiState`]; `None` means development mode.
pub fn api_router(state: Arc<ApiState>) -> Router {
    let auth = AuthLayer::new(state.verifier.clone());
    Router::new()
        .route("/health", get(misc::health))
        .route("/ws/health", get(websocket::ws_health))
        .route("/ws", get(websocket::ws_handler))
        .route("/api/status", get(misc::status))
        // projects
        .route("/api/projects", post(projects::create_project))
        .route("/api/projects", get(projects::list_projects))
        .route("/api/projects/{id}", get(projects::get_project))
        .route("/api/projects/{id}", delete(projects::delete_project))
        // discovery
        .route(
            "/api/projects/{id}/discovery/progress",
            get(discovery::discovery_progress),
        )
        .route(
            "/api/projects/{id}/discovery/start",
            post(discovery::start_discovery),
        )
        .route(
            "/api/projects/{id}/discovery/answer",
            post(discovery::answer_discovery),
        )
        .route(
            "/api/projects/{id}/discovery/generate-tasks",
            post(discovery::generate_tasks),
        )
        // tasks
        .route("/api/projects/{id}/tasks", get(tasks::list_tasks))
        .route("/api/projects/{id}/tasks/approve", post(tasks::approve_tasks))
        .route("/api/projects/{id}/tasks/{task_id}", get(tasks::get_task))
        .route(
            "/api/projects/{id}/tasks/{task_id}/unblock",
            post(tasks::unblock_task),
        )
        // agents, metrics, events
        .route("/api/projects/{id}/agents", get(agents::list_agents))
        .route("/api/projects/{id}/metrics", get(agents::get_metrics))
        .route("/api/projects/{id}/events", get(agents::recent_events))
        // checkpoints
        .route(
            "/api/projects/{id}/checkpoints",
            post(checkpoints::create_checkpoint),
        )
        .route(
            "/api/projects/{id}/checkpoints",
            get(checkpoints::list_checkpoints),
        )
        .route(
            "/api/projects/{id}/checkpoints/{checkpoint_id}",
            delete(checkpoints::delete_checkpoint),
        )
        .route(
            "/api/projects/{id}/checkpoints/{checkpoint_id}/diff",
            get(checkpoints::diff_checkpoint),
        )
        .route(
            "/api/projects/{id}/checkpoints/{checkpoint_id}/restore",
            post(checkpoints::restore_checkpoint),
        )
        // session control
        .route("/api/projects/{id}/session/start", post(session::start_session))
        .route("/api/projects/{id}/session/pause", post(session::pause_session))
        .route(
            "/api/projects/{id}/session/resume",
            post(session::resume_session),
        )
        .route("/api/projects/{id}/session/stop", post(session::stop_session))
        .layer(axum_middleware::from_fn(request_log_middleware))
        .layer(auth)
        .layer(
            CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::DELETE,
                ])
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    axum::http::header::AUTHORIZATION,
                ]),
        )
        .with_state(state)
}
