//! Per-request correlation id and latency logging.
//!
//! Accepts an `x-request-id` header from the caller or generates one, makes
//! it available to handlers via the request headers, stamps it on the
//! response, and wraps the request in a tracing span.  Bodies are never
//! buffered here: the chat route streams SSE responses and must stay
//! pass-through.

use axum::body::Body;
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub static X_REQUEST_ID: &str = "x-request-id";

/// Extract the correlation id placed on the request by [`trace_middleware`].
pub fn request_id(headers: &HeaderMap) -> Uuid {
    headers
        .get(X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .unwrap_or_else(Uuid::new_v4)
}

pub async fn trace_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let id = request_id(req.headers());
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let span = info_span!(
        "http_request",
        request_id = %id,
        method = %method,
        path = %path,
    );

    async move {
        let mut req = req;
        req.headers_mut()
            .insert(X_REQUEST_ID, id.to_string().parse().unwrap());

        let mut response = next.run(req).await;
        response
            .headers_mut()
            .insert(X_REQUEST_ID, id.to_string().parse().unwrap());

        info!(
            status = response.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "request finished"
        );
        response
    }
    .instrument(span)
    .await
}
