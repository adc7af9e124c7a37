//! Aggregation Engine
//!
//! Rebuilds every rollup bucket inside a trailing window on each run
//! instead of updating buckets incrementally. Late or replayed raw rows are
//! therefore always reflected, and running twice over the same rows gives
//! the same buckets.
//!
//! The engine also owns storage housekeeping: retention deletes, compaction
//! after large deletions and planner statistics. Each housekeeping step
//! records its own outcome so one failure never blocks the others.

use crate::aggregation::error::{AggregationError, AggregationResult};
use crate::aggregation::threshold::ThresholdBlock;
use crate::cache::{station_tag, InvalidationSink, AGGREGATES_TAG};
use crate::storage::{AggregateBucket, Granularity, MeasurementRecord, MeasurementStore};
use chrono::{Duration, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Trailing windows and housekeeping thresholds
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Window recomputed for each granularity
    pub windows: BTreeMap<Granularity, Duration>,
    /// Deleted-row count from which a retention run triggers compaction
    pub compaction_threshold: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            windows: Granularity::all()
                .iter()
                .map(|g| (*g, g.default_window()))
                .collect(),
            compaction_threshold: 10_000,
        }
    }
}

impl AggregationConfig {
    fn window(&self, granularity: Granularity) -> Duration {
        self.windows
            .get(&granularity)
            .copied()
            .unwrap_or_else(|| granularity.default_window())
    }
}

/// Outcome of one refresh run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    /// Buckets written per granularity
    pub buckets: BTreeMap<Granularity, usize>,
    /// Raw rows read
    pub rows_scanned: usize,
    /// Stations with rows in any window
    pub stations: Vec<String>,
}

/// Outcome of one housekeeping sub-task
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Done,
    Skipped,
    Failed { error: String },
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }
}

/// Retention result for one table
#[derive(Debug, Clone, Serialize)]
pub struct RetentionOutcome {
    pub table: String,
    pub deleted: usize,
    pub outcome: StepOutcome,
}

/// Outcome of one housekeeping run
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub retention: Vec<RetentionOutcome>,
    pub compaction: StepOutcome,
    pub analyze: StepOutcome,
}

impl MaintenanceReport {
    /// Total rows removed by retention
    pub fn deleted(&self) -> usize {
        self.retention.iter().map(|r| r.deleted).sum()
    }

    /// Whether any sub-task failed
    pub fn has_failures(&self) -> bool {
        self.retention.iter().any(|r| r.outcome.is_failed())
            || self.compaction.is_failed()
            || self.analyze.is_failed()
    }
}

/// Recomputes rollups and applies retention
pub struct AggregationEngine {
    store: Arc<MeasurementStore>,
    config: AggregationConfig,
    invalidator: Option<Arc<dyn InvalidationSink>>,
}

impl AggregationEngine {
    pub fn new(store: Arc<MeasurementStore>, config: AggregationConfig) -> Self {
        Self {
            store,
            config,
            invalidator: None,
        }
    }

    /// Invalidate cached results after every successful refresh
    pub fn with_invalidation(mut self, sink: Arc<dyn InvalidationSink>) -> Self {
        self.invalidator = Some(sink);
        self
    }

    /// Recompute all buckets inside each granularity's trailing window
    pub fn refresh(&self, now: NaiveDateTime) -> AggregationResult<RefreshReport> {
        let starts: Vec<(Granularity, NaiveDateTime)> = Granularity::all()
            .iter()
            .map(|g| (*g, g.floor(now - self.config.window(*g))))
            .collect();

        let earliest = starts
            .iter()
            .map(|(_, start)| *start)
            .min()
            .unwrap_or(now);

        let records = self.store.records_since(earliest)?;
        let thresholds = self.store.thresholds()?;

        let mut report = RefreshReport {
            rows_scanned: records.len(),
            ..Default::default()
        };
        let mut failures = Vec::new();

        for (granularity, window_start) in starts {
            let in_window: Vec<MeasurementRecord> = records
                .iter()
                .filter(|r| r.time >= window_start)
                .cloned()
                .collect();
            let buckets = compute_buckets(&in_window, granularity, &thresholds);

            match self.store.replace_buckets(granularity, window_start, &buckets) {
                Ok(written) => {
                    tracing::debug!(
                        granularity = %granularity,
                        window_start = %window_start,
                        buckets = written,
                        "Rollup window recomputed"
                    );
                    report.buckets.insert(granularity, written);
                }
                Err(e) => {
                    tracing::error!(
                        granularity = %granularity,
                        error = %e,
                        "Rollup refresh failed"
                    );
                    failures.push(e.to_string());
                }
            }
        }

        let stations: BTreeSet<String> = records.iter().map(|r| r.station.clone()).collect();
        report.stations = stations.into_iter().collect();

        if !report.buckets.is_empty() {
            self.invalidate(&report.stations);
        }

        if let Some(first) = failures.first() {
            return Err(AggregationError::Incomplete {
                failed: failures.len(),
                first: first.clone(),
            });
        }

        tracing::info!(
            rows = report.rows_scanned,
            stations = report.stations.len(),
            "Aggregation refresh complete"
        );
        Ok(report)
    }

    fn invalidate(&self, stations: &[String]) {
        if let Some(sink) = &self.invalidator {
            let mut tags = vec![AGGREGATES_TAG.to_string()];
            tags.extend(stations.iter().map(|s| station_tag(s)));
            let removed = sink.invalidate_tags(&tags);
            tracing::debug!(removed, "Invalidated cached aggregates");
        }
    }

    /// Apply retention, compact after large deletions, refresh statistics
    pub fn maintain(&self, now: NaiveDateTime) -> MaintenanceReport {
        let mut retention = Vec::new();

        match self.store.retention_policies() {
            Ok(policies) => {
                for policy in policies.into_iter().filter(|p| p.enabled) {
                    let cutoff = policy.cutoff(now);
                    let outcome = match self.store.delete_older_than(&policy.table, cutoff) {
                        Ok(deleted) => {
                            if let Err(e) = self.store.mark_cleanup(&policy.table, Utc::now()) {
                                tracing::warn!(table = %policy.table, error = %e, "Failed to record cleanup time");
                            }
                            if deleted > 0 {
                                tracing::info!(
                                    table = %policy.table,
                                    deleted,
                                    cutoff = %cutoff,
                                    "Retention cleanup removed rows"
                                );
                            }
                            RetentionOutcome {
                                table: policy.table,
                                deleted,
                                outcome: StepOutcome::Done,
                            }
                        }
                        Err(e) => {
                            tracing::error!(table = %policy.table, error = %e, "Retention cleanup failed");
                            RetentionOutcome {
                                table: policy.table,
                                deleted: 0,
                                outcome: StepOutcome::Failed {
                                    error: e.to_string(),
                                },
                            }
                        }
                    };
                    retention.push(outcome);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to load retention policies");
                retention.push(RetentionOutcome {
                    table: "*".to_string(),
                    deleted: 0,
                    outcome: StepOutcome::Failed {
                        error: e.to_string(),
                    },
                });
            }
        }

        let deleted: usize = retention.iter().map(|r| r.deleted).sum();
        let compaction = if deleted >= self.config.compaction_threshold && deleted > 0 {
            match self.store.compact() {
                Ok(()) => {
                    tracing::info!(deleted, "Store compacted");
                    StepOutcome::Done
                }
                Err(e) => {
                    tracing::error!(error = %e, "Compaction failed");
                    StepOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            }
        } else {
            StepOutcome::Skipped
        };

        let analyze = match self.store.analyze() {
            Ok(()) => StepOutcome::Done,
            Err(e) => {
                tracing::error!(error = %e, "Planner statistics refresh failed");
                StepOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        MaintenanceReport {
            retention,
            compaction,
            analyze,
        }
    }
}

#[derive(Default)]
struct Accumulator {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
    alarms: u64,
}

/// Group rows into buckets of `granularity`
///
/// Output is ordered by `(station, bucket_start)` and does not depend on
/// the order of `records`.
pub fn compute_buckets(
    records: &[MeasurementRecord],
    granularity: Granularity,
    thresholds: &[ThresholdBlock],
) -> Vec<AggregateBucket> {
    let mut by_station: HashMap<&str, Vec<&ThresholdBlock>> = HashMap::new();
    for block in thresholds {
        by_station.entry(block.station.as_str()).or_default().push(block);
    }

    let mut sorted: Vec<&MeasurementRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.station.cmp(&b.station).then(a.time.cmp(&b.time)));

    let mut buckets: BTreeMap<(String, NaiveDateTime), Accumulator> = BTreeMap::new();
    for record in sorted {
        let key = (record.station.clone(), granularity.floor(record.time));
        let acc = buckets.entry(key).or_default();

        if acc.count == 0 {
            acc.min = record.value;
            acc.max = record.value;
        } else {
            acc.min = acc.min.min(record.value);
            acc.max = acc.max.max(record.value);
        }
        acc.sum += record.value;
        acc.count += 1;

        let alarm = by_station
            .get(record.station.as_str())
            .map(|blocks| {
                blocks
                    .iter()
                    .any(|b| b.is_exceeded(record.time.time(), record.value))
            })
            .unwrap_or(false);
        if alarm {
            acc.alarms += 1;
        }
    }

    buckets
        .into_iter()
        .map(|((station, bucket_start), acc)| AggregateBucket {
            station,
            bucket_start,
            granularity,
            avg: acc.sum / acc.count as f64,
            min: acc.min,
            max: acc.max,
            count: acc.count,
            alarm_count: acc.alarms,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::TimeWindow;
    use crate::storage::RetentionPolicy;
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn record(station: &str, time: NaiveDateTime, value: f64) -> MeasurementRecord {
        MeasurementRecord::new(station, time, value)
    }

    #[derive(Default)]
    struct RecordingSink {
        tags: Mutex<Vec<String>>,
    }

    impl InvalidationSink for RecordingSink {
        fn invalidate_tags(&self, tags: &[String]) -> usize {
            self.tags.lock().unwrap().extend(tags.iter().cloned());
            0
        }
    }

    #[test]
    fn test_compute_buckets_statistics() {
        let records = vec![
            record("ort", at(10, 1), 50.0),
            record("ort", at(10, 14), 60.0),
            record("ort", at(10, 16), 40.0),
        ];

        let buckets = compute_buckets(&records, Granularity::FifteenMinutes, &[]);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, at(10, 0));
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[0].avg, 55.0);
        assert_eq!(buckets[0].min, 50.0);
        assert_eq!(buckets[0].max, 60.0);
        assert_eq!(buckets[1].bucket_start, at(10, 15));
        assert_eq!(buckets[1].count, 1);
    }

    #[test]
    fn test_compute_buckets_is_deterministic() {
        let forward = vec![
            record("b", at(1, 5), 41.3),
            record("a", at(1, 10), 52.7),
            record("a", at(1, 20), 48.1),
            record("b", at(1, 50), 39.9),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        let first = compute_buckets(&forward, Granularity::Hourly, &[]);
        let second = compute_buckets(&forward, Granularity::Hourly, &[]);
        let third = compute_buckets(&reversed, Granularity::Hourly, &[]);

        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(first[0].station, "a");
    }

    #[test]
    fn test_alarm_count_uses_overnight_window() {
        let night = ThresholdBlock::new("ort", TimeWindow::parse("22:00", "06:00").unwrap(), 45.0);
        let day = ThresholdBlock::new("ort", TimeWindow::parse("06:00", "22:00").unwrap(), 65.0);
        let records = vec![
            record("ort", at(1, 0), 50.0),   // night, above 45
            record("ort", at(1, 30), 40.0),  // night, below
            record("ort", at(12, 0), 60.0),  // day, below 65
            record("ort", at(12, 10), 70.0), // day, above 65
            record("other", at(1, 0), 99.0), // no thresholds
        ];

        let buckets = compute_buckets(&records, Granularity::Daily, &[night, day]);
        let ort = buckets.iter().find(|b| b.station == "ort").unwrap();
        assert_eq!(ort.alarm_count, 2);
        let other = buckets.iter().find(|b| b.station == "other").unwrap();
        assert_eq!(other.alarm_count, 0);
    }

    #[test]
    fn test_refresh_is_idempotent_and_invalidates() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MeasurementStore::open(dir.path().join("agg.db")).unwrap());
        store
            .upsert_batch(&[
                record("ort", at(9, 50), 50.0),
                record("ort", at(10, 5), 54.0),
                record("ort", at(10, 20), 58.0),
            ])
            .unwrap();

        let sink = Arc::new(RecordingSink::default());
        let engine = AggregationEngine::new(Arc::clone(&store), AggregationConfig::default())
            .with_invalidation(sink.clone());

        let now = at(10, 30);
        let first = engine.refresh(now).unwrap();
        let buckets_first = store.buckets(Granularity::FifteenMinutes, "ort", None).unwrap();
        engine.refresh(now).unwrap();
        let buckets_second = store.buckets(Granularity::FifteenMinutes, "ort", None).unwrap();

        assert_eq!(first.rows_scanned, 3);
        assert_eq!(buckets_first, buckets_second);
        assert_eq!(buckets_first.len(), 3);

        let hourly = store.buckets(Granularity::Hourly, "ort", None).unwrap();
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[1].avg, 56.0);

        let tags = sink.tags.lock().unwrap();
        assert!(tags.contains(&AGGREGATES_TAG.to_string()));
        assert!(tags.contains(&"station_ort".to_string()));
    }

    #[test]
    fn test_refresh_picks_up_late_rows() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MeasurementStore::open(dir.path().join("late.db")).unwrap());
        let engine = AggregationEngine::new(Arc::clone(&store), AggregationConfig::default());

        store.upsert_batch(&[record("ort", at(10, 5), 50.0)]).unwrap();
        engine.refresh(at(10, 30)).unwrap();

        // A row for an already aggregated bucket arrives late
        store.upsert_batch(&[record("ort", at(10, 6), 60.0)]).unwrap();
        engine.refresh(at(10, 30)).unwrap();

        let buckets = store.buckets(Granularity::FifteenMinutes, "ort", None).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[0].avg, 55.0);
    }

    #[test]
    fn test_maintain_applies_retention_per_table() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MeasurementStore::open(dir.path().join("ret.db")).unwrap());
        store
            .upsert_batch(&[
                record("ort", at(1, 0) - Duration::days(40), 50.0),
                record("ort", at(1, 0), 50.0),
            ])
            .unwrap();
        store
            .save_retention_policy(&RetentionPolicy::new("measurements", 30))
            .unwrap();
        store
            .save_retention_policy(&RetentionPolicy::new("measurements_daily", 1).disabled())
            .unwrap();

        let config = AggregationConfig {
            compaction_threshold: 1,
            ..Default::default()
        };
        let engine = AggregationEngine::new(Arc::clone(&store), config);
        let report = engine.maintain(at(2, 0));

        assert_eq!(report.retention.len(), 1);
        assert_eq!(report.deleted(), 1);
        assert_eq!(report.compaction, StepOutcome::Done);
        assert_eq!(report.analyze, StepOutcome::Done);
        assert!(!report.has_failures());
        assert_eq!(store.count(None).unwrap(), 1);
    }

    #[test]
    fn test_maintain_skips_compaction_below_threshold() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MeasurementStore::open(dir.path().join("small.db")).unwrap());
        store
            .save_retention_policy(&RetentionPolicy::new("measurements", 30))
            .unwrap();

        let engine = AggregationEngine::new(store, AggregationConfig::default());
        let report = engine.maintain(at(2, 0));
        assert_eq!(report.compaction, StepOutcome::Skipped);
        assert_eq!(report.deleted(), 0);
    }
}
