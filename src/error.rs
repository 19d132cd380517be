use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::models::ErrorBody;
use crate::validation::ValidationError;

// Machine codes carried in `ErrorBody::code`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidJson,
    InvalidRequest,
    RateLimitExceeded,
    MethodNotAllowed,
    InternalError,
    Timeout,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "INVALID_JSON",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
        }
    }

    /// Caller faults; resending the same request cannot succeed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidJson
                | ErrorCode::InvalidRequest
                | ErrorCode::RateLimitExceeded
                | ErrorCode::MethodNotAllowed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "INVALID_JSON" => ErrorCode::InvalidJson,
            "INVALID_REQUEST" => ErrorCode::InvalidRequest,
            "RATE_LIMIT_EXCEEDED" => ErrorCode::RateLimitExceeded,
            "METHOD_NOT_ALLOWED" => ErrorCode::MethodNotAllowed,
            "INTERNAL_ERROR" => ErrorCode::InternalError,
            "TIMEOUT" => ErrorCode::Timeout,
            "CANCELLED" => ErrorCode::Cancelled,
            _ => return Err(()),
        })
    }
}

const REQUIRED_FIELDS: [&str; 2] = ["mode (chat|analyze|summarize)", "question (string)"];
const OPTIONAL_FIELDS: [&str; 2] = ["context (string)", "settings (object)"];

/// Failures the generation endpoint reports to its caller.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid JSON in request body")]
    InvalidJson,
    #[error("Invalid request format")]
    InvalidRequest(#[source] ValidationError),
    #[error("Rate limit exceeded")]
    RateLimited { limit: u32, window: Duration },
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Internal server error")]
    Internal { message: String, expose: bool },
}

impl ApiError {
    pub fn internal(message: impl Into<String>, expose: bool) -> Self {
        ApiError::Internal {
            message: message.into(),
            expose,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::InvalidJson => ErrorCode::InvalidJson,
            ApiError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            ApiError::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            ApiError::MethodNotAllowed => ErrorCode::MethodNotAllowed,
            ApiError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidJson | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::InvalidJson => Some(json!({
                "required": REQUIRED_FIELDS,
                "optional": OPTIONAL_FIELDS,
            })),
            ApiError::InvalidRequest(reason) => Some(json!({
                "required": REQUIRED_FIELDS,
                "optional": OPTIONAL_FIELDS,
                "reason": reason.to_string(),
            })),
            ApiError::RateLimited { limit, window } => Some(json!({
                "limit": limit,
                "windowMs": window.as_millis() as u64,
            })),
            ApiError::MethodNotAllowed => None,
            ApiError::Internal { message, expose } => {
                expose.then(|| json!({ "message": message }))
            }
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            code: Some(self.code().as_str().to_string()),
            details: self.details(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
