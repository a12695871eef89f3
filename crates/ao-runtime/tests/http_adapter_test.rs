use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ao_core::config::RuntimeConfig;
use ao_core::types::{AgentDefinition, ResourceLimits, RuntimeKind, Task};
use ao_runtime::http::HttpAdapter;
use ao_runtime::wire::HttpTransport;
use ao_runtime::{RuntimeAdapter, RuntimeError, StartSpec};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use semver::Version;
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct AgentState {
    broken: Arc<AtomicBool>,
}

async fn execute(State(state): State<AgentState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if state.broken.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "oops": true })));
    }
    let task = &body["task"];
    if task["type"] == "slow" {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    if task["type"] == "garbage" {
        return (StatusCode::OK, Json(json!(["not", "a", "result"])));
    }
    if task["type"] == "reject" {
        return (
            StatusCode::OK,
            Json(json!({ "success": false, "data": null, "error": "nope" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({ "success": true, "data": { "echo": task["payload"] } })),
    )
}

async fn health(State(state): State<AgentState>) -> StatusCode {
    if state.broken.load(Ordering::SeqCst) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// Serve a fake wire-protocol agent on an ephemeral port.
async fn spawn_agent() -> (String, AgentState) {
    let state = AgentState::default();
    let app = Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn fast_transport() -> HttpTransport {
    HttpTransport::new(&RuntimeConfig {
        connect_retries: 2,
        connect_backoff_ms: 10,
        ..RuntimeConfig::default()
    })
}

fn spec_for(endpoints: Vec<String>, replica_index: usize) -> StartSpec {
    let def = AgentDefinition::new("remote", "quiz", Version::new(1, 0, 0), RuntimeKind::Http)
        .with_config(json!({ "endpoints": endpoints }));
    StartSpec {
        definition: Arc::new(def),
        replica_index,
        resources: ResourceLimits::default(),
    }
}

#[tokio::test]
async fn executes_over_the_wire() {
    let (url, _state) = spawn_agent().await;
    let adapter = HttpAdapter::new(fast_transport());
    let handle = adapter.start(&spec_for(vec![url.clone()], 0)).await.unwrap();
    assert_eq!(handle.url(), Some(url.as_str()));

    adapter
        .health_check(&handle, Duration::from_secs(1))
        .await
        .expect("healthy");

    let task = Task::new("grade", json!({ "answer": 42 }));
    let out = adapter
        .execute(&handle, &task, Duration::from_secs(2))
        .await
        .expect("executes");
    assert!(out.success);
    assert_eq!(out.data["echo"]["answer"], 42);
}

#[tokio::test]
async fn replicas_spread_over_endpoints() {
    let endpoints = vec!["http://127.0.0.1:1".to_string(), "http://127.0.0.1:2".to_string()];
    let adapter = HttpAdapter::new(fast_transport());
    let first = adapter.start(&spec_for(endpoints.clone(), 0)).await.unwrap();
    let second = adapter.start(&spec_for(endpoints.clone(), 1)).await.unwrap();
    let third = adapter.start(&spec_for(endpoints, 2)).await.unwrap();
    assert_eq!(first.url(), Some("http://127.0.0.1:1"));
    assert_eq!(second.url(), Some("http://127.0.0.1:2"));
    assert_eq!(third.url(), Some("http://127.0.0.1:1"));
}

#[tokio::test]
async fn application_rejection_is_returned_not_raised() {
    let (url, _state) = spawn_agent().await;
    let adapter = HttpAdapter::new(fast_transport());
    let handle = adapter.start(&spec_for(vec![url], 0)).await.unwrap();
    let out = adapter
        .execute(&handle, &Task::new("reject", Value::Null), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(!out.success);
    assert_eq!(out.error.as_deref(), Some("nope"));
}

#[tokio::test]
async fn server_errors_and_garbage_are_execution_errors() {
    let (url, state) = spawn_agent().await;
    let adapter = HttpAdapter::new(fast_transport());
    let handle = adapter.start(&spec_for(vec![url], 0)).await.unwrap();

    let err = adapter
        .execute(&handle, &Task::new("garbage", Value::Null), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Execution(ref m) if m.contains("malformed")));

    state.broken.store(true, Ordering::SeqCst);
    let err = adapter
        .execute(&handle, &Task::new("grade", Value::Null), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Execution(_)));
    assert!(adapter
        .health_check(&handle, Duration::from_secs(1))
        .await
        .is_err());
}

#[tokio::test]
async fn deadline_is_enforced() {
    let (url, _state) = spawn_agent().await;
    let adapter = HttpAdapter::new(fast_transport());
    let handle = adapter.start(&spec_for(vec![url], 0)).await.unwrap();
    let err = adapter
        .execute(&handle, &Task::new("slow", Value::Null), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Timeout(_)));
}

#[tokio::test]
async fn refused_connection_is_an_execution_error() {
    // Bind then drop to get a port nobody listens on.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let adapter = HttpAdapter::new(fast_transport());
    let handle = adapter
        .start(&spec_for(vec![format!("http://127.0.0.1:{port}")], 0))
        .await
        .unwrap();
    let err = adapter
        .execute(&handle, &Task::new("grade", Value::Null), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Execution(_)));
}

#[tokio::test]
async fn wait_ready_times_out_on_dead_endpoint() {
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let err = fast_transport()
        .wait_ready(&format!("http://127.0.0.1:{port}"), Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Startup(_)));
}
