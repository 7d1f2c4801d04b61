use axum::http::StatusCode;
use thiserror::Error;

use crate::error::HttpError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("{0}")]
    AlreadyProcessed(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ServiceError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ServiceError::NotFound(what.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ServiceError::Forbidden(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        ServiceError::InvalidState(message.into())
    }

    pub fn already_processed(message: impl Into<String>) -> Self {
        ServiceError::AlreadyProcessed(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation(message.into())
    }

    /// Stable taxonomy name carried in the error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Unauthenticated => "Unauthenticated",
            ServiceError::Forbidden(_) => "Forbidden",
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::InvalidState(_) => "InvalidState",
            ServiceError::InsufficientFunds { .. } => "InsufficientFunds",
            ServiceError::AlreadyProcessed(_) => "AlreadyProcessed",
            ServiceError::Validation(_) => "ValidationError",
            ServiceError::ExternalService(_) => "ExternalServiceError",
            ServiceError::Database(_) | ServiceError::Storage(_) => "StorageError",
        }
    }

    /// Storage failures may be retried by the caller; the ledger's idempotency
    /// guards make a retried step safe.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Database(_) | ServiceError::Storage(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InvalidState(_) | ServiceError::AlreadyProcessed(_) => {
                StatusCode::CONFLICT
            }
            ServiceError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Database(_) | ServiceError::Storage(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl From<ServiceError> for HttpError {
    fn from(error: ServiceError) -> Self {
        let status = error.status_code();
        let kind = error.kind();
        let message = match &error {
            // raw driver errors stay in the logs
            ServiceError::Database(e) => {
                tracing::error!("database error: {}", e);
                "Storage temporarily unavailable, please retry".to_string()
            }
            _ => error.to_string(),
        };
        HttpError::new(message, status).with_kind(kind)
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ServiceError::Validation(errors.to_string())
    }
}
