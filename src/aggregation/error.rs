//! Aggregation error types

use crate::storage::StorageError;
use thiserror::Error;

/// Errors raised while recomputing rollups
#[derive(Error, Debug)]
pub enum AggregationError {
    /// Store read or write failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Some granularities could not be refreshed
    #[error("Refresh incomplete: {failed} granularities failed, first error: {first}")]
    Incomplete { failed: usize, first: String },
}

/// Result type alias for aggregation operations
pub type AggregationResult<T> = Result<T, AggregationError>;
