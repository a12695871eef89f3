use ao_core::OrchestratorError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error returned by every API handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        let err = match self {
            ApiError::BadRequest(_) => return StatusCode::BAD_REQUEST,
            ApiError::Orchestrator(err) => err,
        };
        match err {
            OrchestratorError::DuplicateId(_) | OrchestratorError::DuplicateTask(_) => {
                StatusCode::CONFLICT
            }
            OrchestratorError::InvalidDefinition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::AgentNotFound(_) | OrchestratorError::DeploymentNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            OrchestratorError::NoAvailableAgent(_) | OrchestratorError::CircuitOpen(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OrchestratorError::StartupError(_) | OrchestratorError::ExecutionError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            OrchestratorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            OrchestratorError::ConstraintMismatch(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Orchestrator(err) => err.kind(),
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), kind = self.kind(), error = %self, "api request failed");
        }
        let body = json!({ "error": self.to_string(), "kind": self.kind() });
        (status, Json(body)).into_response()
    }
}
