//! Application error types for robust error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Message log unavailable: {0}")]
    LogUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("JWT error: {0}")]
    Jwt(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Collapse a storage-backend failure into [`AppError::LogUnavailable`].
    pub fn log_unavailable(err: impl std::fmt::Display) -> Self {
        AppError::LogUnavailable(err.to_string())
    }

    /// Stable numeric code sent to WebSocket clients alongside error events.
    pub fn code(&self) -> u16 {
        match self {
            AppError::InvalidPosition(_) => 4001,
            AppError::Validation(_) => 4002,
            AppError::MalformedRecord(_) => 4003,
            AppError::AuthFailure(_) | AppError::Jwt(_) => 4009,
            AppError::NotSignedIn => 4010,
            AppError::LogUnavailable(_) | AppError::Redis(_) | AppError::Db(_) => 4503,
            _ => 4500,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidPosition(_)
            | AppError::Validation(_)
            | AppError::MalformedRecord(_)
            | AppError::Serialization(_) => StatusCode::BAD_REQUEST,
            AppError::AuthFailure(_) | AppError::Jwt(_) | AppError::NotSignedIn => {
                StatusCode::UNAUTHORIZED
            }
            AppError::LogUnavailable(_) | AppError::Redis(_) | AppError::Db(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
