//! API error types with HTTP status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{Error, ErrorCode};

/// API error type with HTTP status code mapping.
#[derive(Debug)]
pub enum ApiError {
    /// VM, snapshot or job not found (404).
    NotFound(ErrorCode, String),
    /// Invalid input (400).
    BadRequest(ErrorCode, String),
    /// Operation not allowed in the current state (409).
    Conflict(String),
    /// An external tool failed (502).
    BadGateway(String),
    /// Internal server error (500).
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: ErrorCode,
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(..) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(..) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message) = match self {
            ApiError::NotFound(code, msg) | ApiError::BadRequest(code, msg) => (code, msg),
            ApiError::Conflict(msg) => (ErrorCode::IllegalTransition, msg),
            ApiError::BadGateway(msg) => (ErrorCode::ConversionFailed, msg),
            ApiError::Internal(msg) => (ErrorCode::InternalError, msg),
        };

        let body = Json(ErrorResponse {
            error: message,
            code,
        });

        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let code = err.code();
        let message = err.to_string();
        match code {
            ErrorCode::VmNotFound | ErrorCode::JobNotFound => ApiError::NotFound(code, message),
            ErrorCode::UnsupportedFormat | ErrorCode::InvalidOptions => {
                ApiError::BadRequest(code, message)
            }
            ErrorCode::IllegalTransition => ApiError::Conflict(message),
            ErrorCode::ConversionFailed => ApiError::BadGateway(message),
            ErrorCode::InternalError => {
                tracing::error!(error = %message, "request failed");
                ApiError::Internal(message)
            }
        }
    }
}
