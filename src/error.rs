use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::responses::{ApiResponse, ErrorResponse};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Missing required header '{header}'")]
    MissingIdentifier { header: String },

    #[error("Header '{header}' must be a valid UUID, got '{value}'")]
    InvalidIdentifier { header: String, value: String },

    #[error("Idempotency store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Corrupt idempotency record at '{key}': {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("A request with idempotency key '{key}' is still being processed")]
    Conflict { key: String },

    #[error("Execution for idempotency key '{key}' timed out")]
    ExecutionTimeout { key: String },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Machine readable code used in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MissingIdentifier { .. } | AppError::InvalidIdentifier { .. } => {
                "MISSING_OR_INVALID_IDENTIFIER"
            }
            AppError::StoreUnavailable(_) | AppError::Redis(_) => "STORE_UNAVAILABLE",
            AppError::CorruptRecord { .. } => "CORRUPT_RECORD",
            AppError::Conflict { .. } => "CONFLICT",
            AppError::ExecutionTimeout { .. } => "EXECUTION_TIMEOUT",
            AppError::Config(_) => "CONFIGURATION_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingIdentifier { .. }
            | AppError::InvalidIdentifier { .. }
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::StoreUnavailable(_) | AppError::Redis(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::ExecutionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::CorruptRecord { .. } | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the failure came from the backing store rather than the request.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, AppError::StoreUnavailable(_) | AppError::Redis(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            AppError::Internal(e) => {
                tracing::error!(error = %e, "Internal error while handling request");
                "Internal server error".to_string()
            }
            AppError::Redis(e) => {
                tracing::error!(error = %e, "Redis error while handling request");
                "Idempotency store unavailable".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(ApiResponse::<()>::error(ErrorResponse::new(self.code(), message)));
        let mut response = (status, body).into_response();

        if matches!(self, AppError::Conflict { .. }) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }

        response
    }
}
