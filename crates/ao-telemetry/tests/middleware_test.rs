use ao_telemetry::metrics::{global_metrics, names};
use ao_telemetry::middleware::metrics_middleware;
use ao_telemetry::tracing_setup::{request_id_middleware, REQUEST_ID_HEADER};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{middleware, Router};
use tower::ServiceExt;

fn app() -> Router {
    Router::new()
        .route("/api/agents/{id}/health", get(|| async { "ok" }))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
}

#[tokio::test]
async fn request_id_is_echoed() {
    let resp = app()
        .oneshot(
            Request::builder()
                .uri("/api/agents/a1/health")
                .header(REQUEST_ID_HEADER, "abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[REQUEST_ID_HEADER], "abc-123");
}

#[tokio::test]
async fn request_id_is_minted_when_absent() {
    let resp = app()
        .oneshot(
            Request::builder()
                .uri("/api/agents/a1/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let id = resp.headers()[REQUEST_ID_HEADER].to_str().unwrap();
    assert_eq!(id.len(), 32);
}

#[tokio::test]
async fn metrics_use_route_template() {
    let labels = [
        ("method", "GET"),
        ("path", "/api/agents/{id}/health"),
        ("status", "200"),
    ];
    let before = global_metrics().get_counter(names::API_REQUESTS_TOTAL, &labels);

    for id in ["a", "b"] {
        app()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/agents/{id}/health"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
    }

    let after = global_metrics().get_counter(names::API_REQUESTS_TOTAL, &labels);
    assert!(after >= before + 2);
}
