use std::time::Instant;

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Wraps each request in a span carrying a request id so relay events can be
/// correlated, then logs the outcome at a level matching the status class.
/// Health checks pass through untouched.
pub async fn logging_middleware(req: Request<Body>, next: Next) -> Response {
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let request_id = Uuid::new_v4().simple().to_string();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let span = info_span!("request", request_id, method, path);

    let start = Instant::now();
    let response = next.run(req).instrument(span.clone()).await;
    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    span.in_scope(|| match status {
        500.. => error!(status, duration_ms, "request failed"),
        400..=499 => warn!(status, duration_ms, "request rejected"),
        _ => info!(status, duration_ms, "request served"),
    });

    response
}
