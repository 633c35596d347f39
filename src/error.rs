/*
 * Responsibility
 * - AppError taxonomy shared by handlers and services
 * - IntoResponse (HTTP status / JSON error body)
 * - all authentication failures collapse to one fixed 401 body
 */
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::repos::error::RepoError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Bad credentials, signature, or proof. Which check failed is never
    /// surfaced to the caller (no oracle); details go to the logs only.
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("conflict: {0}")]
    Conflict(&'static str),

    #[error("not found")]
    NotFound,

    #[error("rate limited")]
    RateLimited,

    #[error("internal server error")]
    Internal,
}

#[derive(Serialize)]
struct ErrorResponseBody {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::InvalidRequest(message) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", message),
            AppError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHENTICATED",
                // Fixed body for every authentication failure.
                "authentication failed".to_string(),
            ),
            AppError::Conflict(what) => (StatusCode::CONFLICT, "CONFLICT", what.to_string()),
            AppError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", "not found".to_string()),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "too many requests".to_string(),
            ),
            AppError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "internal server error".to_string(),
            ),
        };

        let body = ErrorResponseBody {
            error: ErrorBody { code, message },
        };

        (status, Json(body)).into_response()
    }
}

impl From<RepoError> for AppError {
    fn from(_: RepoError) -> Self {
        AppError::Internal
    }
}
