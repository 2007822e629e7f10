//! Storage error handling
//!
//! Provides typed errors for storage adapters with descriptive messages
//! and recovery suggestions. Capacity failures get their own type because
//! callers are expected to react to them (evict data, disable persistence).

use std::io;

use thiserror::Error;

/// A write was rejected because the backend ran out of space
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Storage quota exceeded while writing '{key}' ({attempted_size_bytes} bytes)")]
pub struct QuotaExceededError {
    /// Key that was being written
    pub key: String,
    /// Size of the rejected payload in bytes
    pub attempted_size_bytes: usize,
}

impl QuotaExceededError {
    pub fn new(key: impl Into<String>, attempted_size_bytes: usize) -> Self {
        Self {
            key: key.into(),
            attempted_size_bytes,
        }
    }
}

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend is full
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceededError),

    /// Backend rejected the operation for a reason other than capacity
    #[error("{adapter} storage failed on '{key}': {details}")]
    Backend {
        adapter: &'static str,
        key: String,
        details: String,
    },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The blocking task running a database transaction did not complete
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded(_))
    }

    /// The quota details, if this is a capacity failure
    pub fn as_quota(&self) -> Option<&QuotaExceededError> {
        match self {
            StorageError::QuotaExceeded(quota) => Some(quota),
            _ => None,
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::QuotaExceeded(_) => {
                Some("Remove unused keys or enable compression to reduce payload size.")
            }
            StorageError::Database(_) => {
                Some("Check that the database file is writable and not locked by another process.")
            }
            StorageError::Io(_) => Some("Check that the data directory exists and is writable."),
            _ => None,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
