//! # stationflow
//!
//! Ingestion core for station measurement files: semicolon-separated
//! exports land in per-station directories, are imported with resumable
//! checkpoints, rolled up into 15-minute, hourly and daily buckets, and
//! served through a tag-invalidated two-tier cache.
//!
//! ## Modules
//!
//! - [`storage`]: SQLite measurement store, rollup tables and retention
//! - [`ingest`]: row normalization and the checkpointed row processor
//! - [`coordinator`]: prioritized import queue with a bounded worker pool
//! - [`aggregation`]: rollup recomputation and store housekeeping
//! - [`cache`]: memory + disk cache with tag invalidation and warmup
//! - [`watcher`]: debounced directory watching per station
//! - [`scheduler`]: non-overlapping timed jobs with timeout and retry
//! - [`weather`]: optional current-weather source with fallback
//! - [`api`]: read-only status surface
//! - [`service`]: assembly and lifecycle
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stationflow::config::Config;
//! use stationflow::coordinator::Priority;
//! use stationflow::service::Service;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default()?;
//!     config.validate()?;
//!
//!     let service = Service::build(config)?;
//!     service.start();
//!
//!     let id = service
//!         .coordinator()
//!         .submit("station_a", "/data/incoming/station_a/2024-03-09.csv", Priority::High)?;
//!     let job = service.coordinator().wait(id).await?;
//!     println!("{:?}", job.outcome);
//!
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

pub mod aggregation;
pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod ingest;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod watcher;
pub mod weather;

// Re-export top-level types for convenience
pub use storage::{
    AggregateBucket, Granularity, MeasurementRecord, MeasurementStore, RetentionPolicy,
    StorageError, StorageResult,
};

pub use ingest::{Checkpoint, FileOutcome, IngestError, ProcessorConfig, RowProcessor};

pub use coordinator::{
    CoordinatorConfig, CoordinatorError, ImportCoordinator, ImportEvent, ImportJob, JobId,
    JobStatus, Priority,
};

pub use aggregation::{AggregationConfig, AggregationEngine, MaintenanceReport, RefreshReport};

pub use cache::{CacheConfig, CacheError, CacheWarmer, IntelligentCache, SetOptions};

pub use scheduler::{
    BlockingSlot, JobRunStats, JobSchedule, ScheduledTask, Scheduler, SchedulerError,
};

pub use watcher::{ChangeDetector, StationDir, WatcherConfig};

pub use weather::{WeatherObservation, WeatherProvider};

pub use api::{build_router, serve, ApiConfig, ApiError, AppState};

pub use config::{Config, ConfigError};

pub use service::{Service, ServiceError};
