use axum::{body::Body, extract::MatchedPath, extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::metrics::{global_metrics, names};

/// Records `api_requests_total{method,path,status}` and
/// `api_request_duration_seconds` for every request.
///
/// The path label uses the matched route template (`/api/agents/{id}`) so
/// agent ids do not explode label cardinality.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    let m = global_metrics();
    m.increment_counter(
        names::API_REQUESTS_TOTAL,
        &[("method", &method), ("path", &path), ("status", &status)],
    );
    m.record_histogram(
        names::API_REQUEST_DURATION_SECONDS,
        &[],
        start.elapsed().as_secs_f64(),
    );

    response
}
