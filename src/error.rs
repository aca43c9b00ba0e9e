//! Error types for Memo Core.
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias for Memo operations
pub type MemoResult<T> = Result<T, MemoError>;

/// Main error type for Memo operations
#[derive(Error, Debug)]
pub enum MemoError {
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database operation failed: {0}")]
    DatabaseOperation(String),

    #[error("Local storage quota exceeded writing {key}: {size} bytes (limit {limit})")]
    QuotaExceeded {
        key: String,
        size: usize,
        limit: usize,
    },

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Remote storage error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl MemoError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        MemoError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new sync error
    pub fn sync(message: impl Into<String>) -> Self {
        MemoError::Sync(message.into())
    }

    /// Create a new database operation error
    pub fn database_op(message: impl Into<String>) -> Self {
        MemoError::DatabaseOperation(message.into())
    }

    /// True if this error came from the local storage quota
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, MemoError::QuotaExceeded { .. })
    }
}

/// Validation error with field and message
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for MemoError {
    fn from(err: ValidationError) -> Self {
        MemoError::Validation {
            field: err.field,
            message: err.message,
        }
    }
}
