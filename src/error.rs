//! HTTP-facing error handling
//!
//! Errors that surface before the SSE stream opens map to HTTP statuses.
//! Anything after headers are flushed goes in-band as an `error` event
//! instead (see server::chat).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// Standard API error response
#[derive(Debug)]
pub struct ApiError {
    pub message: String,
    pub status_code: StatusCode,
    pub error_code: Option<String>,
}

impl ApiError {
    /// Malformed body, unknown field, bad effort value, oversize attachments
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::BAD_REQUEST,
            error_code: Some("INVALID_REQUEST".to_string()),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::UNAUTHORIZED,
            error_code: Some("UNAUTHORIZED".to_string()),
        }
    }

    /// Conversation (or other row) missing or owned by another user
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::NOT_FOUND,
            error_code: Some("NOT_FOUND".to_string()),
        }
    }

    /// Model provider key absent; fatal before the stream opens
    pub fn missing_provider_key(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            error_code: Some("PROVIDER_MISSING_KEY".to_string()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
            error_code: Some("INTERNAL_ERROR".to_string()),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!(status = %self.status_code, "{}", self.message);
        }

        let body = json!({
            "error": self.message,
            "code": self.error_code,
        });

        (self.status_code, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::internal(format!("database error: {e}"))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::invalid_request("bad").status_code,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::not_found("gone").status_code,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::missing_provider_key("no key").status_code,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_display() {
        let e = ApiError::unauthorized("missing user");
        assert_eq!(e.to_string(), "missing user");
    }
}
