//! Error types and result handling for core operations.
//!
//! Defines the structured error taxonomy shared by the repository layer
//! and the delivery engine: validation failures, expected conflicts on
//! idempotency keys, missing entities, rejected state transitions, and
//! infrastructure failures.

use thiserror::Error;

use crate::models::SendStatus;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for domain and persistence operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input fails domain validation (bad timezone, out-of-range hour).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Constraint violation, most commonly a duplicate idempotency key.
    ///
    /// Duplicate keys are expected during planning and are swallowed by
    /// `create_if_absent`; this variant surfaces only where a conflict is
    /// genuinely unexpected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A status transition not permitted by the send state machine.
    ///
    /// Returned without mutating the record, e.g. when a worker attempts
    /// to move a record that was cancelled underneath it.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Status the record currently holds.
        from: SendStatus,
        /// Status the caller attempted to move to.
        to: SendStatus,
    },

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),
}

impl CoreError {
    /// Creates a validation error from a message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a conflict error from a message.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Creates a not-found error from a message.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a database error from a message.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Conflict(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::Conflict(format!("foreign key constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
