//! Bearer-token authentication for the HTTP and push surfaces.
//!
//! Token issuance and verification belong to an external collaborator; the
//! core consumes an opaque token and a [`TokenVerifier`] that resolves it
//! to a principal. A constant-time static-key verifier ships for
//! single-operator deployments, and `None` disables auth (development
//! mode). Health probes are always exempt; the websocket upgrade carries
//! its token in the query string and authenticates in its own handler.

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::task::{Context, Poll};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};

// ---------------------------------------------------------------------------
// Principal / TokenVerifier
// ---------------------------------------------------------------------------

/// Authenticated caller identity as reported by the external verifier.
#[derive(Debug, Clone)]
pub struct Principal {
    pub principal_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

pub trait TokenVerifier: Send + Sync {
    /// Resolve an opaque bearer token to a principal, or `None` when the
    /// token is invalid or expired.
    fn verify(&self, token: &str) -> Option<Principal>;
}

/// Single shared-key verifier with constant-time comparison.
pub struct StaticTokenVerifier {
    token: String,
}

impl StaticTokenVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<Principal> {
        if bool::from(token.as_bytes().ct_eq(self.token.as_bytes())) {
            Some(Principal {
                principal_id: "operator".into(),
                expires_at: None,
            })
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// AuthLayer
// ---------------------------------------------------------------------------

/// Paths that never require a token.
fn is_exempt(path: &str) -> bool {
    matches!(path, "/health" | "/ws/health" | "/ws")
}

/// A [`tower::Layer`] enforcing bearer auth on every non-exempt route.
#[derive(Clone)]
pub struct AuthLayer {
    /// `None` = development mode (all requests pass through).
    verifier: Option<Arc<dyn TokenVerifier>>,
}

impl AuthLayer {
    pub fn new(verifier: Option<Arc<dyn TokenVerifier>>) -> Self {
        Self { verifier }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            verifier: self.verifier.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    verifier: Option<Arc<dyn TokenVerifier>>,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let verifier = self.verifier.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(verifier) = verifier else {
                return inner.call(req).await;
            };
            if is_exempt(req.uri().path()) {
                return inner.call(req).await;
            }

            let token = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string);

            let principal = token.as_deref().and_then(|t| verifier.verify(t));
            match principal {
                Some(principal) => {
                    req.extensions_mut().insert(principal);
                    inner.call(req).await
                }
                None => {
                    let resp = (
                        StatusCode::UNAUTHORIZED,
                        axum::Json(serde_json::json!({
                            "error": {"kind": "unauthenticated", "message": "missing or invalid bearer token"}
                        })),
                    )
                        .into_response();
                    Ok(resp)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
