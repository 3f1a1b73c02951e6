//! HTTP API error taxonomy.
//!
//! One enum covers every client-visible failure; `IntoResponse` renders the
//! uniform `{"error": {"kind", "message", "details?"}}` body with the
//! matching status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use cf_core::store::StoreError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    /// Request body violates schema or field constraints.
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Malformed path or query input.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Phase or status precondition failed; the client may re-query and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Task decomposition contained a dependency cycle.
    #[error("cyclic decomposition: {message}")]
    Cyclic {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
            details: None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation { .. } => "validation",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthenticated(_) => "unauthenticated",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Cyclic { .. } => "cyclic",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } | ApiError::Cyclic { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let details = match &self {
            ApiError::Validation { details, .. } | ApiError::Cyclic { details, .. } => {
                details.clone()
            }
            _ => None,
        };
        let mut error = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Some(details) = details {
            error["details"] = details;
        }
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => ApiError::NotFound(msg),
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::Persistence(msg) => ApiError::Internal(msg),
        }
    }
}

#[cfg(feature = "libgit2")]
impl From<cf_core::checkpoint::CheckpointError> for ApiError {
    fn from(e: cf_core::checkpoint::CheckpointError) -> Self {
        use cf_core::checkpoint::CheckpointError;
        match e {
            CheckpointError::Conflict(msg) => ApiError::Conflict(msg),
            CheckpointError::Store(inner) => inner.into(),
            CheckpointError::Git(msg) => ApiError::Internal(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn conflict_maps_to_409_with_kind() {
        let resp = ApiError::Conflict("phase mismatch".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["kind"], "conflict");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("phase mismatch"));
    }

    #[tokio::test]
    async fn validation_carries_field_details() {
        let resp = ApiError::Validation {
            message: "bad body".into(),
            details: Some(json!({"name": "must not be empty"})),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["details"]["name"], "must not be empty");
    }

    #[tokio::test]
    async fn cyclic_is_422() {
        let resp = ApiError::Cyclic {
            message: "1 -> 2 -> 1".into(),
            details: None,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["kind"], "cyclic");
    }

    #[test]
    fn store_errors_map_onto_http_kinds() {
        assert!(matches!(
            ApiError::from(StoreError::NotFound("x".into())),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(StoreError::Conflict("x".into())),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            ApiError::from(StoreError::Persistence("x".into())),
            ApiError::Internal(_)
        ));
    }
}
