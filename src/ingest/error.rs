//! Ingestion error types
//!
//! Row-level problems ([`RowError`]) skip a single row and never abort a
//! file. File-level problems ([`IngestError`]) abort the current attempt.

use crate::storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Why a single row was rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowError {
    /// A required field is absent or empty
    #[error("missing field: {0}")]
    MissingField(String),

    /// Time or date could not be decomposed
    #[error("malformed timestamp: {0}")]
    MalformedTimestamp(String),

    /// The value column is not a number
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The value is outside the plausible range
    #[error("value out of range: {0}")]
    OutOfRangeValue(f64),
}

/// Errors that abort a file-processing attempt
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),

    #[error("Giving up on {path:?} after {attempts} attempts: {last_error}")]
    AttemptsExhausted {
        path: PathBuf,
        attempts: u32,
        last_error: String,
    },
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        IngestError::Storage(err.into())
    }
}

/// Result type alias for ingestion operations
pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_error_display() {
        assert_eq!(
            RowError::MissingField("Systemzeit".to_string()).to_string(),
            "missing field: Systemzeit"
        );
        assert_eq!(
            RowError::OutOfRangeValue(250.0).to_string(),
            "value out of range: 250"
        );
    }

    #[test]
    fn test_sqlite_busy_maps_to_storage_busy() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            None,
        );
        match IngestError::from(busy) {
            IngestError::Storage(e) => assert!(e.is_busy()),
            other => panic!("unexpected error: {}", other),
        }
    }
}
