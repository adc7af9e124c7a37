//! Stationflow Measurement Store
//!
//! - **types**: Core data structures (MeasurementRecord, AggregateBucket, RetentionPolicy)
//! - **store**: SQLite tables with upsert semantics and rollup tables
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Row Processor → writer connection → BEGIN → upsert × N → COMMIT
//!
//! Rollup Path:
//!   Aggregation Engine → records_since(window) → compute → replace_buckets
//! ```

pub mod error;
pub mod store;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use store::{MeasurementStore, StoreStats};
pub use types::{
    default_retention_policies, table_spec, AggregateBucket, Granularity, MeasurementRecord,
    RetentionPolicy, TableSpec, DATETIME_FORMAT, ISO_DATETIME_FORMAT, MANAGED_TABLES,
};
