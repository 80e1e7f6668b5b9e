use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Every caller-visible failure mode the agent can produce, per the error
/// taxonomy: validation, not-available, not-found, conflict, transient
/// external failure, integrity failure, internal.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not available: {0}")]
    NotAvailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient external failure: {0}")]
    Transient(String),

    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn not_available(msg: impl Into<String>) -> Self {
        Self::NotAvailable(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AgentError::Validation(_) => StatusCode::BAD_REQUEST,
            AgentError::NotAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::Conflict(_) => StatusCode::SERVICE_UNAVAILABLE,
            AgentError::Transient(_) => StatusCode::BAD_GATEWAY,
            AgentError::Integrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AgentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(e: anyhow::Error) -> Self {
        AgentError::Internal(format!("{e:#}"))
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Internal(e.to_string())
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
        }
        (status, Json(json!({"success": false, "error": self.to_string()}))).into_response()
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
