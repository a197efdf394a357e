//! Error types for flow store operations

use thiserror::Error;

/// Result type for flow store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during flow store operations
///
/// `Storage` is the transient-transport variant: callers must treat it like
/// a failed compare-and-swap (nothing was mutated) and retry or escalate.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Row not found
    #[error("Flow not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// Transient storage/transport error; no mutation happened
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid row or argument
    #[error("Invalid snapshot: {0}")]
    Invalid(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}
