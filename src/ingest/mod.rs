//! Checkpointed ingestion of station files
//!
//! - **row**: header resolution, validation and normalization of single rows
//! - **checkpoint**: per-file resume position stored next to the source file
//! - **processor**: streams a file into the store inside one transaction
//! - **error**: row-level and file-level error types

pub mod checkpoint;
pub mod error;
pub mod processor;
pub mod row;

pub use checkpoint::{is_sidecar, sidecar_path, Checkpoint, Durability};
pub use error::{IngestError, IngestResult, RowError};
pub use processor::{FileOutcome, ProcessorConfig, RowProcessor};
pub use row::{ColumnConfig, RowContext, RowSchema};
