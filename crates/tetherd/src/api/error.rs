//! Unified API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::agent::CallError;
use crate::pairing::PairFailure;

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many attempts, retry in {retry_after_secs}s")]
    Locked { retry_after_secs: u64 },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Agent error: {0}")]
    BadGateway(String),

    #[error("Agent timeout: {0}")]
    GatewayTimeout(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Locked { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Conflict(_) => "CONFLICT",
            Self::Locked { .. } => "LOCKED",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::BadGateway(_) => "AGENT_ERROR",
            Self::GatewayTimeout(_) => "AGENT_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Locked { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let retry_after_secs = self.retry_after_secs();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) | ApiError::BadGateway(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) | ApiError::GatewayTimeout(msg) => {
                warn!(error_code = code, message = %msg, "Agent unavailable");
            }
            _ => {
                tracing::debug!(error_code = code, message = %message, "Client error");
            }
        }

        let body = ErrorResponse {
            error: message,
            code,
            retry_after_secs,
        };

        (status, Json(body)).into_response()
    }
}

/// Process-call failures map onto upstream-flavored status codes; the
/// agent's error text is passed through verbatim.
impl From<CallError> for ApiError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Unavailable(msg) => ApiError::ServiceUnavailable(msg),
            CallError::Rejected(msg) => ApiError::BadGateway(msg),
            CallError::Timeout(..) => ApiError::GatewayTimeout(err.to_string()),
            CallError::ProcessExited(msg) => ApiError::BadGateway(msg),
        }
    }
}

impl From<PairFailure> for ApiError {
    fn from(err: PairFailure) -> Self {
        match err {
            PairFailure::PairingDisabled => ApiError::BadRequest(err.to_string()),
            PairFailure::Locked { retry_after_secs } => ApiError::Locked { retry_after_secs },
            PairFailure::AlreadyPaired => ApiError::Conflict(err.to_string()),
            PairFailure::InvalidCode => ApiError::Unauthorized(err.to_string()),
            PairFailure::Storage(msg) => ApiError::Internal(msg),
        }
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::bad_request("").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::unauthorized("").status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Locked {
                retry_after_secs: 10
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::internal("").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_call_error_mapping() {
        assert!(matches!(
            ApiError::from(CallError::Unavailable("gone".into())),
            ApiError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            ApiError::from(CallError::Rejected("bad model".into())),
            ApiError::BadGateway(msg) if msg == "bad model"
        ));
        assert!(matches!(
            ApiError::from(CallError::Timeout(Duration::from_secs(5), "prompt".into())),
            ApiError::GatewayTimeout(_)
        ));
    }

    #[test]
    fn test_pair_failure_mapping() {
        assert!(matches!(
            ApiError::from(PairFailure::InvalidCode),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            ApiError::from(PairFailure::AlreadyPaired),
            ApiError::Conflict(_)
        ));
        let locked: ApiError = PairFailure::Locked {
            retry_after_secs: 42,
        }
        .into();
        assert_eq!(locked.retry_after_secs(), Some(42));
    }
}
