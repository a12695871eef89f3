use uuid::Uuid;

use crate::types::InstanceId;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Every failure the orchestration API can surface.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("agent id already registered: {0}")]
    DuplicateId(String),

    #[error("invalid agent definition: {0}")]
    InvalidDefinition(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("instance failed to start: {0}")]
    StartupError(String),

    #[error("execution failed on instance {instance_id}: {reason}")]
    ExecutionError {
        instance_id: InstanceId,
        reason: String,
    },

    #[error("timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("circuit open for every eligible instance of `{0}`")]
    CircuitOpen(String),

    #[error("no available agent for `{0}`")]
    NoAvailableAgent(String),

    #[error("constraint mismatch: {0}")]
    ConstraintMismatch(String),

    #[error("task {0} is already being dispatched")]
    DuplicateTask(Uuid),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Failures the router may retry against a different instance.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ExecutionError { .. } | OrchestratorError::Timeout { .. }
        )
    }

    /// Stable machine-readable name, used in API bodies and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::DuplicateId(_) => "duplicate_id",
            OrchestratorError::InvalidDefinition(_) => "invalid_definition",
            OrchestratorError::AgentNotFound(_) => "agent_not_found",
            OrchestratorError::DeploymentNotFound(_) => "deployment_not_found",
            OrchestratorError::StartupError(_) => "startup_error",
            OrchestratorError::ExecutionError { .. } => "execution_error",
            OrchestratorError::Timeout { .. } => "timeout",
            OrchestratorError::CircuitOpen(_) => "circuit_open",
            OrchestratorError::NoAvailableAgent(_) => "no_available_agent",
            OrchestratorError::ConstraintMismatch(_) => "constraint_mismatch",
            OrchestratorError::DuplicateTask(_) => "duplicate_task",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_transient() {
        let exec = OrchestratorError::ExecutionError {
            instance_id: Uuid::new_v4(),
            reason: "connection refused".into(),
        };
        assert!(exec.is_transient());
        assert!(OrchestratorError::Timeout { elapsed_ms: 10 }.is_transient());
        assert!(!OrchestratorError::CircuitOpen("echo".into()).is_transient());
        assert!(!OrchestratorError::ConstraintMismatch("x".into()).is_transient());
        assert!(!OrchestratorError::NoAvailableAgent("echo".into()).is_transient());
    }

    #[test]
    fn kinds_are_snake_case() {
        assert_eq!(OrchestratorError::DuplicateId("a".into()).kind(), "duplicate_id");
        assert_eq!(
            OrchestratorError::DuplicateTask(Uuid::nil()).kind(),
            "duplicate_task"
        );
    }
}
