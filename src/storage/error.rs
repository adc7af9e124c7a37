//! Measurement store error types
//!
//! Defines all errors that can occur in the storage layer.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur in the measurement store
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The database is locked by another writer (transient, retryable)
    #[error("Storage busy: {0}")]
    Busy(String),

    /// Any other SQLite failure
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Table name is not one of the managed tables
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed
    pub fn is_busy(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StorageError::Busy(err.to_string())
            }
            _ => StorageError::Database(err),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_detection() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let err: StorageError = busy.into();
        assert!(err.is_busy());

        let other = rusqlite::Error::QueryReturnedNoRows;
        let err: StorageError = other.into();
        assert!(!err.is_busy());
        assert!(matches!(err, StorageError::Database(_)));
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::UnknownTable("users".to_string());
        assert_eq!(err.to_string(), "Unknown table: users");
    }
}
