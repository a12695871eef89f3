use std::collections::BTreeSet;
use std::sync::Arc;

use ao_core::types::{
    AgentDefinition, AgentSummary, AutoscalePolicy, DeploymentStatus, DeploymentView, HealthState,
    InstanceView, ResourceLimits, RuntimeKind, Task, TaskResult,
};
use ao_core::OrchestratorError;
use ao_orchestrator::registry::AgentDetail;
use ao_orchestrator::{DeploySpec, Orchestrator};
use ao_telemetry::metrics::global_metrics;
use ao_telemetry::middleware::metrics_middleware;
use ao_telemetry::tracing_setup::{request_id_middleware, REQUEST_ID_HEADER};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::api_error::ApiError;

pub type ApiState = Arc<Orchestrator>;

/// Every route the daemon serves.
pub fn api_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/api/agents", get(list_agents).post(register_agent))
        .route("/api/agents/{id}", get(get_agent).delete(unregister_agent))
        .route("/api/agents/{id}/deploy", post(deploy_agent))
        .route("/api/agents/{id}/scale", post(scale_agent))
        .route("/api/agents/{id}/health", get(agent_health))
        .route("/api/tasks/{agent_type}", post(execute_task))
        .route("/api/metrics", get(metrics_prometheus))
        .route("/api/metrics/json", get(metrics_json))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

/// Body of `POST /api/agents`. Version and runtime arrive as strings so a
/// malformed value maps to `InvalidDefinition` instead of a JSON rejection.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub version: String,
    pub runtime: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl RegisterRequest {
    fn into_definition(self) -> Result<AgentDefinition, OrchestratorError> {
        let version = semver::Version::parse(self.version.trim()).map_err(|e| {
            OrchestratorError::InvalidDefinition(format!("version `{}`: {e}", self.version))
        })?;
        let runtime: RuntimeKind = self
            .runtime
            .parse()
            .map_err(OrchestratorError::InvalidDefinition)?;
        let mut definition = AgentDefinition::new(self.id, self.agent_type, version, runtime)
            .with_config(self.config);
        definition.capabilities = self.capabilities;
        Ok(definition)
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    #[serde(default = "one")]
    pub replicas: usize,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub autoscale: Option<AutoscalePolicy>,
}

fn one() -> usize {
    1
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub deployment_id: Uuid,
    pub status: DeploymentStatus,
    pub failures: u32,
    pub replicas: usize,
}

impl From<&DeploymentView> for DeployResponse {
    fn from(view: &DeploymentView) -> Self {
        Self {
            deployment_id: view.deployment_id,
            status: view.status,
            failures: view.startup_failures,
            replicas: view.instances.len(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub replicas: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub agent_id: String,
    pub status: HealthState,
    pub last_check: Option<DateTime<Utc>>,
    pub instances: Vec<InstanceView>,
}

#[derive(Debug, Serialize)]
pub struct Ack {
    pub id: String,
    pub ok: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /health -- liveness.
async fn liveness() -> &'static str {
    "ok"
}

/// GET /api/agents -- every registered agent with its deployment status.
async fn list_agents(State(orch): State<ApiState>) -> Json<Vec<AgentSummary>> {
    Json(orch.list().await)
}

/// POST /api/agents -- register a definition. 201 with `{id}`.
async fn register_agent(
    State(orch): State<ApiState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let definition = req.into_definition()?;
    let id = orch.register(definition)?;
    Ok((StatusCode::CREATED, Json(RegisterResponse { id })))
}

/// GET /api/agents/{id} -- definition plus current deployment, if any.
async fn get_agent(
    State(orch): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<AgentDetail>, ApiError> {
    Ok(Json(orch.get(&id).await?))
}

/// DELETE /api/agents/{id} -- drain and stop all instances, then forget the agent.
async fn unregister_agent(
    State(orch): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    orch.unregister(&id).await?;
    Ok(Json(Ack { id, ok: true }))
}

/// POST /api/agents/{id}/deploy -- start (or re-target) a deployment.
///
/// A partial startup failure still answers 200 with `status: degraded` and the
/// failure count; reconciliation keeps retrying the missing replicas.
async fn deploy_agent(
    State(orch): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<DeployRequest>,
) -> Result<Json<DeployResponse>, ApiError> {
    let mut spec = DeploySpec::replicas(req.replicas).with_resources(req.resources);
    if let Some(policy) = req.autoscale {
        spec = spec.with_autoscale(policy);
    }
    let view = orch.deploy(&id, spec).await?;
    Ok(Json(DeployResponse::from(&view)))
}

/// POST /api/agents/{id}/scale -- change the replica count. Answers once
/// scale-down victims have drained.
async fn scale_agent(
    State(orch): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ScaleRequest>,
) -> Result<Json<DeployResponse>, ApiError> {
    let view = orch.scale(&id, req.replicas).await?;
    Ok(Json(DeployResponse::from(&view)))
}

/// GET /api/agents/{id}/health -- aggregated health plus per-instance detail.
async fn agent_health(
    State(orch): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<HealthResponse>, ApiError> {
    let report = orch.health(&id).await?;
    Ok(Json(HealthResponse {
        agent_id: report.agent_id,
        status: report.status,
        last_check: report.last_check,
        instances: report.instances,
    }))
}

/// POST /api/tasks/{agent_type} -- route one task to an instance of the type.
///
/// The body is a task (`type`, `payload`, optional `id`, `context`,
/// `constraints`, `timeout_ms`). The request id minted by the middleware is
/// carried into the task context so router logs share the trace.
async fn execute_task(
    State(orch): State<ApiState>,
    Path(agent_type): Path<String>,
    headers: HeaderMap,
    Json(mut task): Json<Task>,
) -> Result<Json<TaskResult>, ApiError> {
    if task.task_type.trim().is_empty() {
        return Err(ApiError::BadRequest("task type must not be empty".into()));
    }
    if task.context.request_id.is_none() {
        task.context.request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
    }
    Ok(Json(orch.execute_task(&agent_type, task).await?))
}

/// GET /api/metrics -- Prometheus text exposition.
async fn metrics_prometheus() -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        global_metrics().export_prometheus(),
    )
}

/// GET /api/metrics/json -- the same metrics as JSON.
async fn metrics_json() -> Json<serde_json::Value> {
    Json(global_metrics().export_json())
}
