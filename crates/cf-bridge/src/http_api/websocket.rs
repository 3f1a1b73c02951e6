//! The push-telemetry endpoint.
//!
//! `GET /ws?project_id=…&token=…` upgrades to a stream of JSON frames from
//! the project's topic. Authentication happens after the upgrade so the
//! rejection can use the policy-violation close code (1008). No history is
//! replayed — late joiners reconcile through the query endpoints first.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use super::state::ApiState;
use super::types::WsQuery;

const POLICY_VIOLATION: u16 = 1008;

/// GET /ws — subscribe to a project's telemetry stream.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ApiState>, query: WsQuery) {
    if let Some(verifier) = &state.verifier {
        let authorized = query
            .token
            .as_deref()
            .and_then(|t| verifier.verify(t))
            .is_some();
        if !authorized {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: POLICY_VIOLATION,
                    reason: "authentication rejected".into(),
                })))
                .await;
            return;
        }
    }
    if state.store.get_project(query.project_id).await.is_err() {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: POLICY_VIOLATION,
                reason: "unknown project".into(),
            })))
            .await;
        return;
    }

    let rx = state.bus.subscribe(query.project_id);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(30));
    heartbeat.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            frame = rx.recv_async() => {
                match frame {
                    Ok(frame) => {
                        let json = serde_json::to_string(&frame).unwrap_or_default();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // evicted or bus dropped
                    Err(_) => break,
                }
            }
            _ = heartbeat.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    tracing::debug!(project_id = query.project_id, "push subscriber disconnected");
}

/// GET /ws/health — ready only once the broadcaster is fully wired.
pub(crate) async fn ws_health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    if state.bus.is_ready() {
        (
            axum::http::StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "ready" })),
        )
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({ "status": "starting" })),
        )
    }
}
