//! The service's recurring jobs

use crate::aggregation::AggregationEngine;
use crate::cache::CacheWarmer;
use crate::scheduler::{BlockingSlot, ScheduledTask};
use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;

/// Rebuilds rollups over their trailing windows
pub struct AggregateTask {
    engine: Arc<AggregationEngine>,
    slot: BlockingSlot,
}

impl AggregateTask {
    pub const NAME: &'static str = "aggregate";

    pub fn new(engine: Arc<AggregationEngine>) -> Self {
        Self {
            engine,
            slot: BlockingSlot::new(),
        }
    }
}

#[async_trait]
impl ScheduledTask for AggregateTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<(), String> {
        let engine = Arc::clone(&self.engine);
        let report = self
            .slot
            .run(move || engine.refresh(Local::now().naive_local()))
            .await?
            .map_err(|e| e.to_string())?;

        tracing::info!(
            rows = report.rows_scanned,
            stations = report.stations.len(),
            buckets = report.buckets.values().sum::<usize>(),
            "Aggregates refreshed"
        );
        Ok(())
    }
}

/// Retention, compaction and planner statistics
pub struct RetentionTask {
    engine: Arc<AggregationEngine>,
    slot: BlockingSlot,
}

impl RetentionTask {
    pub const NAME: &'static str = "retention";

    pub fn new(engine: Arc<AggregationEngine>) -> Self {
        Self {
            engine,
            slot: BlockingSlot::new(),
        }
    }
}

#[async_trait]
impl ScheduledTask for RetentionTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<(), String> {
        let engine = Arc::clone(&self.engine);
        let report = self
            .slot
            .run(move || engine.maintain(Local::now().naive_local()))
            .await?;

        if report.has_failures() {
            let failed: Vec<String> = report
                .retention
                .iter()
                .filter(|r| r.outcome.is_failed())
                .map(|r| r.table.clone())
                .collect();
            return Err(format!(
                "maintenance incomplete (failed tables: {:?}, compaction: {:?}, analyze: {:?})",
                failed, report.compaction, report.analyze
            ));
        }

        tracing::info!(deleted = report.deleted(), "Maintenance finished");
        Ok(())
    }
}

pub struct CacheWarmupTask {
    warmer: Arc<CacheWarmer>,
}

impl CacheWarmupTask {
    pub const NAME: &'static str = "cache-warmup";

    pub fn new(warmer: Arc<CacheWarmer>) -> Self {
        Self { warmer }
    }
}

#[async_trait]
impl ScheduledTask for CacheWarmupTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<(), String> {
        let report = self.warmer.warm().await.map_err(|e| e.to_string())?;
        tracing::info!(
            stations = report.stations,
            entries = report.entries,
            failures = report.failures,
            "Cache warmed"
        );
        Ok(())
    }
}
