use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use claude_mem_core::{AgentError, CoreError};
use claude_mem_store::StoreError;
use serde_json::json;

/// Wire-shape error: `{"error": <code>, "message": <human>}`.
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, message = %self.message, "request failed");
        } else {
            tracing::warn!(code = self.code, message = %self.message, "request rejected");
        }
        (
            self.status,
            Json(json!({ "error": self.code, "message": self.message })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::NotFound(_) => Self::not_found(e.to_string()),
            _ if e.is_caller_error() => Self::bad_request(e.to_string()),
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Store(inner) => inner.into(),
            CoreError::NotFound(message) => Self::not_found(message),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        match &e {
            AgentError::InvalidIdFormat(_) => Self::bad_request(e.to_string()),
            AgentError::Locked { until_epoch } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "agent_locked",
                format!("agent locked until {until_epoch}"),
            ),
            AgentError::InvalidKey
            | AgentError::Expired
            | AgentError::Revoked
            | AgentError::Unknown(_) => Self::unauthorized(e.to_string()),
            AgentError::Store(inner) => match inner {
                StoreError::NotFound(_) => Self::not_found(e.to_string()),
                _ => Self::internal(e.to_string()),
            },
        }
    }
}
