use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Axum middleware that tags each request with an `X-Request-Id` header
/// (reusing an incoming one when present) and logs method, path, status,
/// and latency on completion.
pub async fn request_log_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("req-{}", NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)));

    if let Ok(value) = axum::http::HeaderValue::from_str(&request_id) {
        request.headers_mut().insert("x-request-id", value);
    }

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let mut response = next.run(request).await;

    let elapsed_ms = start.elapsed().as_millis() as u64;
    tracing::info!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms,
        request_id = %request_id,
        "request"
    );

    if let Ok(value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
