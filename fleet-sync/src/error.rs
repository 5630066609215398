//! Error types for fleet-sync
//!
//! `PipelineError` is the failure taxonomy shared by the poller, rate
//! limiter and write-back queue. `ApiError` is what HTTP handlers return.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Pipeline failure taxonomy
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// Network failure or timeout talking to the provider
    #[error("Transport error: {0}")]
    Transport(String),

    /// Provider answered with a non-zero status code
    #[error("Provider error {status_code}: {message}")]
    Provider { status_code: i64, message: String },

    /// Circuit breaker is open; the upstream was not contacted
    #[error("Circuit open: upstream calls suspended for {remaining_secs}s")]
    CircuitOpen { remaining_secs: u64 },

    /// A single record failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Provider payload could not be parsed at all
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Write to the store failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// No usable upstream session
    #[error("Auth error: {0}")]
    Auth(String),
}

impl PipelineError {
    /// Whether the rate limiter may retry the failed call
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Transport(_) | PipelineError::Provider { .. }
        )
    }

    /// Short machine-readable code for logs and socket error frames
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Transport(_) => "TRANSPORT_ERROR",
            PipelineError::Provider { .. } => "PROVIDER_ERROR",
            PipelineError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            PipelineError::Validation(_) => "VALIDATION_ERROR",
            PipelineError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            PipelineError::Persistence(_) => "PERSISTENCE_ERROR",
            PipelineError::Auth(_) => "AUTH_ERROR",
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Persistence(err.to_string())
    }
}

impl From<fleet_common::Error> for PipelineError {
    fn from(err: fleet_common::Error) -> Self {
        match err {
            fleet_common::Error::InvalidInput(msg) => PipelineError::Validation(msg),
            other => PipelineError::Persistence(other.to_string()),
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Common error: {0}")]
    Common(#[from] fleet_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Pipeline(ref err) => {
                let status = match err {
                    PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
                    PipelineError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    PipelineError::Auth(_) => StatusCode::UNAUTHORIZED,
                    PipelineError::Transport(_)
                    | PipelineError::Provider { .. }
                    | PipelineError::MalformedPayload(_) => StatusCode::BAD_GATEWAY,
                    PipelineError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code(), err.to_string())
            }
            ApiError::Common(ref err) => {
                let status = match err {
                    fleet_common::Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, "COMMON_ERROR", err.to_string())
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::Transport("timeout".into()).is_retryable());
        assert!(PipelineError::Provider {
            status_code: 3,
            message: "busy".into()
        }
        .is_retryable());
        assert!(!PipelineError::CircuitOpen { remaining_secs: 10 }.is_retryable());
        assert!(!PipelineError::MalformedPayload("eof".into()).is_retryable());
        assert!(!PipelineError::Auth("expired".into()).is_retryable());
    }

    #[test]
    fn test_invalid_input_maps_to_validation() {
        let err: PipelineError = fleet_common::Error::InvalidInput("bad lat".into()).into();
        assert_eq!(err, PipelineError::Validation("bad lat".into()));
    }

    #[test]
    fn test_api_error_status_codes() {
        let response = ApiError::BadRequest("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError::Pipeline(PipelineError::CircuitOpen { remaining_secs: 5 })
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
