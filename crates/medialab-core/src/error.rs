//! Unified error handling for Media Lab
//!
//! One error type covers billing rule violations, provider failures and
//! infrastructure faults, with HTTP response mapping for the health surface.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    // ==================== Database Errors ====================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database pool error: {0}")]
    Pool(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    // ==================== Queue Errors ====================
    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Queue connection failed: {0}")]
    QueueConnection(String),

    // ==================== Billing Errors ====================
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("Invalid discount code: {0}")]
    InvalidDiscountCode(String),

    #[error("Unknown operation kind: {0}")]
    UnknownOperationKind(String),

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Invalid state transition for operation {operation_id}: {from} -> {to}")]
    InvalidStateTransition {
        operation_id: String,
        from: String,
        to: String,
    },

    #[error("User not found: {0}")]
    UserNotFound(String),

    // ==================== Provider Errors ====================
    #[error("Provider failed (retryable): {0}")]
    ProviderRetryable(String),

    #[error("Provider failed: {0}")]
    ProviderTerminal(String),

    // ==================== Validation Errors ====================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ==================== Resource Errors ====================
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // ==================== Internal Errors ====================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AppError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation(_)
            | AppError::InvalidInput(_)
            | AppError::InvalidDiscountCode(_)
            | AppError::UnknownOperationKind(_) => StatusCode::BAD_REQUEST,

            // 402 Payment Required
            AppError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,

            // 404 Not Found
            AppError::OperationNotFound(_) | AppError::UserNotFound(_) => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::InvalidStateTransition { .. } | AppError::AlreadyExists(_) => {
                StatusCode::CONFLICT
            }

            // 502 Bad Gateway
            AppError::ProviderRetryable(_) | AppError::ProviderTerminal(_) => {
                StatusCode::BAD_GATEWAY
            }

            // 503 Service Unavailable
            AppError::QueueConnection(_) | AppError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error code for API responses and log fields
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database_error",
            AppError::Pool(_) => "pool_error",
            AppError::Transaction(_) => "transaction_error",
            AppError::Queue(_) => "queue_error",
            AppError::QueueConnection(_) => "queue_connection_error",
            AppError::InsufficientBalance { .. } => "insufficient_balance",
            AppError::InvalidDiscountCode(_) => "invalid_discount_code",
            AppError::UnknownOperationKind(_) => "unknown_operation_kind",
            AppError::OperationNotFound(_) => "operation_not_found",
            AppError::InvalidStateTransition { .. } => "invalid_state_transition",
            AppError::UserNotFound(_) => "user_not_found",
            AppError::ProviderRetryable(_) => "provider_retryable",
            AppError::ProviderTerminal(_) => "provider_terminal",
            AppError::Validation(_) => "validation_error",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::AlreadyExists(_) => "already_exists",
            AppError::Internal(_) => "internal_error",
            AppError::Config(_) => "config_error",
            AppError::Serialization(_) => "serialization_error",
        }
    }

    /// Whether a worker may retry the job that produced this error.
    ///
    /// Only provider-side transient failures qualify. Ledger anomalies are
    /// never retried blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ProviderRetryable(_))
    }

    /// Errors that indicate a delivery or programming anomaly rather than a
    /// user-facing rejection.
    pub fn is_ledger_anomaly(&self) -> bool {
        matches!(
            self,
            AppError::OperationNotFound(_) | AppError::InvalidStateTransition { .. }
        )
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        AppError::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let body = json!({
            "error": self.error_code(),
            "message": self.to_string(),
            "status": status.as_u16(),
        });

        HttpResponse::build(status).json(body)
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}
