use axum::{body::Body, extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// 32 hex characters, usable as an OpenTelemetry trace id.
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// 16 hex characters.
pub fn generate_span_id() -> String {
    let mut id = Uuid::new_v4().as_simple().to_string();
    id.truncate(16);
    id
}

/// Reuse the caller's `X-Request-Id` or mint one, run the request inside a
/// span carrying it, and echo it on the response.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(generate_trace_id);

    let header = HeaderValue::from_str(&request_id)
        .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
    request.headers_mut().insert(REQUEST_ID_HEADER, header.clone());

    let span = tracing::info_span!(
        "http_request",
        trace_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = next.run(request).instrument(span).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, header);
    response
}

/// Span for one routed task. Every dispatch attempt for the task is logged
/// inside it, so retries share one trace id.
pub fn task_span(agent_type: &str, task_id: &Uuid, request_id: Option<&str>) -> (tracing::Span, String) {
    let trace_id = request_id
        .map(str::to_owned)
        .unwrap_or_else(generate_trace_id);
    let span = tracing::info_span!(
        "route_task",
        trace_id = %trace_id,
        span_id = %generate_span_id(),
        agent_type = %agent_type,
        task_id = %task_id,
    );
    (span, trace_id)
}

/// Child span for a single dispatch attempt.
pub fn attempt_span(trace_id: &str, attempt: u32, instance_id: &Uuid) -> tracing::Span {
    tracing::debug_span!(
        "dispatch",
        trace_id = %trace_id,
        span_id = %generate_span_id(),
        attempt,
        instance_id = %instance_id,
    )
}
