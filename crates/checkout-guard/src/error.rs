//! Error types for the checkout guard

use std::time::Duration;
use thiserror::Error;

/// Error type for lock, idempotency and configuration operations
#[derive(Error, Debug)]
pub enum GuardError {
    /// The named lock stayed held by another session for the whole wait.
    /// Expected under load; callers turn it into a "processing, please retry" response.
    #[error("Lock {name} still held after waiting {waited:?}")]
    LockContended { name: String, waited: Duration },

    /// The store could not be reached or answered with something unusable
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Database connection or query error
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Submission cannot be fingerprinted
    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GuardError {
    /// Whether this error means the store itself failed.
    /// These must stop order creation (fail closed).
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Database(_))
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable(message.into())
    }
}

/// Result type alias for guard operations
pub type GuardResult<T> = std::result::Result<T, GuardError>;
