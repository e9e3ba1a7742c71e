//! ReelBatch Error Definitions
//!
//! Defines error types used throughout the project.

use thiserror::Error;

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Submission Errors
    // =========================================================================
    #[error("Batch has no items")]
    EmptyBatch,

    #[error("Operation not registered: {0}")]
    UnknownOperation(String),

    #[error("Invalid concurrency limit: {0} (must be at least 1)")]
    InvalidConcurrency(usize),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core engine result type
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Returns true for errors caused by bad input to `submit`
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::EmptyBatch
                | CoreError::UnknownOperation(_)
                | CoreError::InvalidConcurrency(_)
                | CoreError::ValidationError(_)
        )
    }
}
