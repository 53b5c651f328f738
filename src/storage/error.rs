//! Storage layer error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Corrupt stream: {0}")]
    CorruptStream(String),

    #[error("Corrupt page: {0}")]
    CorruptPage(String),

    #[error("Page is full: requires {required} bytes but only {available} available")]
    PageFull { required: u64, available: u64 },

    #[error("Row not found: {row_id}")]
    RowNotFound { row_id: u64 },

    #[error("Cache miss: {kind} {id} is not in the working set")]
    CacheMiss { kind: &'static str, id: Uuid },

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Schema '{name}' still has {tables} table(s)")]
    SchemaNotEmpty { name: String, tables: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Worker pool has been shut down")]
    Shutdown,

    #[error("Other error: {0}")]
    Other(String),
}

impl StorageError {
    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        StorageError::IntegrityViolation(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        StorageError::CorruptStream(msg.into())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
