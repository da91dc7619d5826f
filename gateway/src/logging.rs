use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Middleware that logs HTTP requests.
///
/// Health probes and worker heartbeats log at DEBUG to keep the INFO
/// stream focused on data-plane traffic.
pub async fn request_logger(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let chatty = path == "/health" || path.ends_with("/heartbeat");

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    if chatty {
        tracing::debug!(%method, %path, status, duration_ms, "HTTP request");
    } else {
        tracing::info!(%method, %path, status, duration_ms, "HTTP request");
    }

    response
}
