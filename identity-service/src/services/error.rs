use chrono::{DateTime, Utc};
use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    // Deliberately generic: the audit log carries the specific reason, the
    // caller never does.
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Account locked until {until}")]
    AccountLocked { until: DateTime<Utc> },

    #[error("Too many attempts")]
    RateLimited { retry_after: u64 },

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token already used")]
    TokenAlreadyUsed,

    #[error("Account not found")]
    AccountNotFound,

    #[error("Email already registered")]
    EmailConflict,

    #[error("Account was never migrated")]
    NotMigrated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Upstream identity provider error: {0}")]
    Upstream(String),

    #[error("Audit chain integrity failure: {0}")]
    Integrity(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Internal(e) => AppError::InternalError(e),
            ServiceError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ServiceError::InvalidCredentials => {
                AppError::AuthError(anyhow::anyhow!("Invalid email or password"))
            }
            ServiceError::AccountLocked { until } => AppError::AuthError(anyhow::anyhow!(
                "Account locked until {}",
                until.to_rfc3339()
            )),
            ServiceError::RateLimited { retry_after } => AppError::TooManyRequests(
                "Too many attempts. Please try again later.".to_string(),
                Some(retry_after),
            ),
            ServiceError::InvalidToken => AppError::BadRequest(anyhow::anyhow!("Invalid token")),
            ServiceError::TokenExpired => AppError::BadRequest(anyhow::anyhow!("Token expired")),
            ServiceError::TokenAlreadyUsed => {
                AppError::Conflict(anyhow::anyhow!("Token already used"))
            }
            ServiceError::AccountNotFound => {
                AppError::NotFound(anyhow::anyhow!("Account not found"))
            }
            ServiceError::EmailConflict => {
                AppError::Conflict(anyhow::anyhow!("Email already registered"))
            }
            ServiceError::NotMigrated => {
                AppError::Conflict(anyhow::anyhow!("Account was never migrated"))
            }
            ServiceError::Forbidden(msg) => AppError::Forbidden(anyhow::anyhow!(msg)),
            ServiceError::Upstream(msg) => AppError::UpstreamError(msg),
            ServiceError::Integrity(msg) => AppError::IntegrityError(msg),
        }
    }
}
