//! Error types for the Taskgate service.

use thiserror::Error;

use crate::ratelimit::StoreError;
use crate::tasks::TaskStoreError;

/// Main error type for Taskgate operations.
#[derive(Error, Debug)]
pub enum TaskgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit policy that must be rejected before serving traffic
    #[error("Invalid rate limit policy for operation '{operation}': {reason}")]
    InvalidPolicy { operation: String, reason: String },

    /// Counter store errors surfaced outside of admission decisions
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// Task store errors raised while opening the database
    #[error("Task store error: {0}")]
    TaskStore(#[from] TaskStoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskgateError {
    pub(crate) fn invalid_policy(operation: &str, reason: impl Into<String>) -> Self {
        TaskgateError::InvalidPolicy {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for Taskgate operations.
pub type Result<T> = std::result::Result<T, TaskgateError>;
