//! Archive storage error types
//!
//! Defines all errors that can occur in the storage layer.

use thiserror::Error;

/// Errors that can occur in the archive engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (checksum mismatch, bad field, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Record layout could not be determined or decoded
    #[error("Invalid record layout: {0}")]
    InvalidLayout(String),

    /// Mutation attempted on a period that is no longer writable
    #[error("Period {0} is finalized (read-only)")]
    PeriodFinalized(String),

    /// Requested entry does not exist in the period
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// Mutation attempted through an archive opened for inspection only
    #[error("Archive is open read-only: {0}")]
    ReadOnly(String),

    /// No period covers the requested time, or it cannot be opened
    #[error("Archive unavailable: {0}")]
    ArchiveUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StorageError::Lock(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
