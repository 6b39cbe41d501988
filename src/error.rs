//! HTTP error type.
//!
//! Domain functions return `Result<T, String>`; handlers convert with `?`
//! and the message decides the status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// The store or the carrier failed or is not configured.
    #[error("{0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Upstream(_) => "upstream_error",
            AppError::Database(_) => "database_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

const NOT_FOUND_MARKERS: &[&str] = &["not found", "غير موجود"];
const CONFLICT_MARKERS: &[&str] = &["duplicate", "already exists", "unique constraint", "مكرر", "بنفس"];
const UPSTREAM_MARKERS: &[&str] = &[
    "(http ",
    "not configured",
    "cannot reach",
    "timed out",
    "store returned",
    "invalid json from",
    "bosta",
];
const DATABASE_MARKERS: &[&str] = &["sqlite", "database", "begin transaction", "commit:"];
const INTERNAL_MARKERS: &[&str] = &["poisoned", "panicked"];

impl From<String> for AppError {
    fn from(message: String) -> Self {
        let lower = message.to_lowercase();
        let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));
        if has(INTERNAL_MARKERS) {
            AppError::Internal(message)
        } else if has(NOT_FOUND_MARKERS) {
            AppError::NotFound(message)
        } else if has(CONFLICT_MARKERS) {
            AppError::Conflict(message)
        } else if has(UPSTREAM_MARKERS) {
            AppError::Upstream(message)
        } else if has(DATABASE_MARKERS) {
            AppError::Database(message)
        } else {
            AppError::Validation(message)
        }
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::from(message.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Database(msg) => {
                error!(target: "database", error = %msg, "Database error occurred");
                "Database error".to_string()
            }
            AppError::Internal(msg) => {
                error!(target: "internal", error = %msg, "Internal error occurred");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "code": self.code(), "message": message }))).into_response()
    }
}
