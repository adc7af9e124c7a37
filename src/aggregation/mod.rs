//! Rollup aggregation
//!
//! - **threshold**: time-of-day alarm limits, including overnight windows
//! - **engine**: trailing-window recomputation plus retention/compaction/statistics
//! - **error**: error types

pub mod engine;
pub mod error;
pub mod threshold;

pub use engine::{
    compute_buckets, AggregationConfig, AggregationEngine, MaintenanceReport, RefreshReport,
    RetentionOutcome, StepOutcome,
};
pub use error::{AggregationError, AggregationResult};
pub use threshold::{ThresholdBlock, TimeWindow};
