//! Error handling module
//!
//! Application-wide error type returned by command handlers and the ops
//! router, with its HTTP response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::concurrency::GuardError;
use crate::domain::DomainError;
use crate::store::StoreError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Outbox record not found: {0}")]
    OutboxRecordNotFound(String),

    #[error("Outbox record {0} is not poisoned")]
    NotPoisoned(String),

    #[error("Version conflict: concurrent modification detected")]
    VersionConflict,

    // Domain errors
    #[error(transparent)]
    Domain(#[from] DomainError),

    // Server errors (5xx)
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Store(StoreError),
}

impl AppError {
    /// Whether re-submitting the same command may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::VersionConflict | AppError::Unavailable(_))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        if err.is_conflict() {
            return AppError::VersionConflict;
        }
        match err {
            StoreError::Unavailable(msg) => AppError::Unavailable(msg),
            other => AppError::Store(other),
        }
    }
}

impl From<GuardError> for AppError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::NotFound { id, .. } => AppError::AccountNotFound(id.to_string()),
            GuardError::Domain(e) => AppError::Domain(e),
            GuardError::Store(e) => e.into(),
        }
    }
}

impl From<crate::domain::AmountError> for AppError {
    fn from(err: crate::domain::AmountError) -> Self {
        AppError::Domain(DomainError::InvalidAmount(err.to_string()))
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            // 400 Bad Request
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", Some(msg.clone()))
            }

            // 404 Not Found
            AppError::AccountNotFound(id) => {
                (StatusCode::NOT_FOUND, "account_not_found", Some(id.clone()))
            }
            AppError::OutboxRecordNotFound(id) => {
                (StatusCode::NOT_FOUND, "outbox_record_not_found", Some(id.clone()))
            }

            // 409 Conflict
            AppError::NotPoisoned(id) => {
                (StatusCode::CONFLICT, "not_poisoned", Some(id.clone()))
            }
            AppError::VersionConflict => {
                (StatusCode::CONFLICT, "version_conflict", None)
            }

            // Domain errors - map to appropriate HTTP status
            AppError::Domain(domain_err) => {
                let status = match domain_err {
                    DomainError::BusinessRuleViolation(_) | DomainError::NonZeroBalance { .. } => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    DomainError::AccountClosed(_)
                    | DomainError::AccountFrozen(_)
                    | DomainError::AccountNotClosed(_) => StatusCode::CONFLICT,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, domain_err.code(), Some(domain_err.to_string()))
            }

            // 503 Service Unavailable
            AppError::Unavailable(msg) => {
                tracing::warn!("Storage unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", None)
            }

            // 500 Internal Server Error
            AppError::Store(e) => {
                tracing::error!("Storage error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_error", None)
            }
        };

        let body = ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}
