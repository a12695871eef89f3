use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constraints::Constraints;

/// Identifier of a single running agent instance.
pub type InstanceId = Uuid;

// ---------------------------------------------------------------------------
// RuntimeKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    InProcess,
    Http,
    Container,
    Process,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 4] = [
        RuntimeKind::InProcess,
        RuntimeKind::Http,
        RuntimeKind::Container,
        RuntimeKind::Process,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::InProcess => "in-process",
            RuntimeKind::Http => "http",
            RuntimeKind::Container => "container",
            RuntimeKind::Process => "process",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in-process" | "in_process" | "inprocess" => Ok(RuntimeKind::InProcess),
            "http" => Ok(RuntimeKind::Http),
            "container" | "docker" => Ok(RuntimeKind::Container),
            "process" => Ok(RuntimeKind::Process),
            other => Err(format!("unknown runtime kind `{other}`")),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentDefinition
// ---------------------------------------------------------------------------

/// Immutable description of a deployable agent.
///
/// `config` is opaque to the registry; the runtime adapter matching
/// `runtime` validates it at registration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub version: Version,
    pub runtime: RuntimeKind,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AgentDefinition {
    pub fn new(
        id: impl Into<String>,
        agent_type: impl Into<String>,
        version: Version,
        runtime: RuntimeKind,
    ) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            version,
            runtime,
            capabilities: BTreeSet::new(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Look up a string field in the opaque config object.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    /// Look up an unsigned integer field in the opaque config object.
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| v.as_u64())
    }
}

// ---------------------------------------------------------------------------
// Deployment-related types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
}

/// Bounds and target used by the auto-scaler for one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalePolicy {
    pub min_replicas: usize,
    pub max_replicas: usize,
    /// Fraction of admission capacity (0, 1] the scaler aims to keep busy.
    #[serde(default = "default_target_utilization")]
    pub target_utilization: f64,
}

fn default_target_utilization() -> f64 {
    0.7
}

impl AutoscalePolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_replicas == 0 {
            return Err("max_replicas must be at least 1".into());
        }
        if self.min_replicas > self.max_replicas {
            return Err(format!(
                "min_replicas ({}) exceeds max_replicas ({})",
                self.min_replicas, self.max_replicas
            ));
        }
        if !(self.target_utilization > 0.0 && self.target_utilization <= 1.0) {
            return Err(format!(
                "target_utilization must be in (0, 1], got {}",
                self.target_utilization
            ));
        }
        Ok(())
    }

    /// Clamp a replica count into `[min_replicas, max_replicas]`.
    pub fn clamp(&self, replicas: usize) -> usize {
        replicas.clamp(self.min_replicas, self.max_replicas)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Healthy,
    Degraded,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStatus::Healthy => f.write_str("healthy"),
            DeploymentStatus::Degraded => f.write_str("degraded"),
        }
    }
}

// ---------------------------------------------------------------------------
// HealthState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    /// Healthy and Degraded instances may receive traffic.
    pub fn is_routable(&self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::Degraded)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// BreakerState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation, all calls pass through.
    Closed,
    /// Too many failures, calls are rejected without contacting the instance.
    Open,
    /// Reset timeout elapsed, a single trial call is allowed.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub context: TaskContext,
    #[serde(default)]
    pub constraints: Constraints,
    /// Overall deadline for the task across all attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            payload,
            context: TaskContext::default(),
            constraints: Constraints::default(),
            timeout_ms: None,
        }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Raw outcome reported by an agent for one task.
///
/// `success == false` is an application-level rejection, not an
/// infrastructure failure; the router never retries it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutput {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: false,
            data,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub latency_ms: u64,
    pub instance_id: InstanceId,
    pub agent_id: String,
    pub version: String,
    pub runtime: RuntimeKind,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: TaskMetadata,
}

impl TaskResult {
    pub fn from_output(output: TaskOutput, metadata: TaskMetadata) -> Self {
        let data = if output.data.is_null() {
            None
        } else {
            Some(output.data)
        };
        Self {
            success: output.success,
            data,
            error: output.error,
            metadata,
        }
    }
}

// ---------------------------------------------------------------------------
// Read-only views
// ---------------------------------------------------------------------------

/// Aggregate status reported by `list()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered but never deployed.
    Registered,
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub version: String,
    pub runtime: RuntimeKind,
    pub status: AgentStatus,
    pub replicas: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceView {
    pub id: InstanceId,
    pub agent_id: String,
    pub runtime: RuntimeKind,
    pub target: String,
    pub health: HealthState,
    pub breaker: BreakerState,
    pub in_flight: usize,
    pub ema_latency_ms: Option<f64>,
    pub draining: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentView {
    pub deployment_id: Uuid,
    pub agent_id: String,
    pub desired_replicas: usize,
    pub status: DeploymentStatus,
    pub startup_failures: u32,
    pub resources: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscale: Option<AutoscalePolicy>,
    pub instances: Vec<InstanceView>,
}

/// Answer to `health(id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub agent_id: String,
    pub status: HealthState,
    pub last_check: Option<DateTime<Utc>>,
    pub instances: Vec<InstanceView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_kind_round_trips_through_strings() {
        for kind in RuntimeKind::ALL {
            assert_eq!(kind.as_str().parse::<RuntimeKind>().unwrap(), kind);
        }
        assert_eq!("docker".parse::<RuntimeKind>().unwrap(), RuntimeKind::Container);
        assert!("lambda".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn definition_serializes_type_field() {
        let def = AgentDefinition::new("echo-1", "echo", Version::new(1, 2, 0), RuntimeKind::InProcess)
            .with_capability("ping");
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["type"], "echo");
        assert_eq!(json["version"], "1.2.0");
        assert_eq!(json["runtime"], "in-process");
        assert_eq!(json["capabilities"][0], "ping");
    }

    #[test]
    fn task_deserializes_with_defaults() {
        let task: Task = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(task.task_type, "ping");
        assert!(task.payload.is_null());
        assert!(task.constraints.capabilities.is_empty());
        assert!(task.timeout_ms.is_none());
    }

    #[test]
    fn only_healthy_and_degraded_are_routable() {
        assert!(HealthState::Healthy.is_routable());
        assert!(HealthState::Degraded.is_routable());
        assert!(!HealthState::Unknown.is_routable());
        assert!(!HealthState::Unhealthy.is_routable());
    }

    #[test]
    fn autoscale_policy_validation() {
        let ok = AutoscalePolicy {
            min_replicas: 1,
            max_replicas: 4,
            target_utilization: 0.5,
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.clamp(9), 4);
        assert_eq!(ok.clamp(0), 1);

        let inverted = AutoscalePolicy {
            min_replicas: 5,
            max_replicas: 2,
            target_utilization: 0.5,
        };
        assert!(inverted.validate().is_err());

        let zero_target = AutoscalePolicy {
            min_replicas: 1,
            max_replicas: 2,
            target_utilization: 0.0,
        };
        assert!(zero_target.validate().is_err());
    }

    #[test]
    fn task_result_drops_null_data() {
        let meta = TaskMetadata {
            latency_ms: 3,
            instance_id: Uuid::new_v4(),
            agent_id: "a".into(),
            version: "1.0.0".into(),
            runtime: RuntimeKind::Http,
            attempts: 1,
        };
        let result = TaskResult::from_output(TaskOutput::ok(serde_json::Value::Null), meta);
        assert!(result.success);
        assert!(result.data.is_none());
    }
}
