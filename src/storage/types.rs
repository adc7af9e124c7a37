//! Core data types for the measurement store
//!
//! - `MeasurementRecord`: one validated row from a station file
//! - `AggregateBucket`: a derived rollup over a fixed-width window
//! - `Granularity`: the rollup widths the store maintains
//! - `RetentionPolicy`: how long each table keeps its rows

use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Storage format for the canonical datetime column
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// ISO 8601 form exposed to readers
pub const ISO_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A single measurement as written to the store
///
/// Unique on `(station, time)`. Writing the same key twice replaces the
/// earlier row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementRecord {
    /// Station the file came from
    pub station: String,
    /// Canonical local datetime of the measurement
    pub time: NaiveDateTime,
    /// Measured value
    pub value: f64,
    /// File name the row was read from
    pub source_file: String,
    /// All fields of the original row, keyed by header
    #[serde(default)]
    pub raw_fields: serde_json::Value,
}

impl MeasurementRecord {
    pub fn new(station: impl Into<String>, time: NaiveDateTime, value: f64) -> Self {
        Self {
            station: station.into(),
            time,
            value,
            source_file: String::new(),
            raw_fields: serde_json::Value::Null,
        }
    }

    /// Builder method: set the source file
    pub fn source_file(mut self, file: impl Into<String>) -> Self {
        self.source_file = file.into();
        self
    }

    /// Builder method: set the raw row fields
    pub fn raw_fields(mut self, fields: serde_json::Value) -> Self {
        self.raw_fields = fields;
        self
    }

    /// Key column value as stored
    pub fn time_key(&self) -> String {
        self.time.format(DATETIME_FORMAT).to_string()
    }

    /// ISO 8601 datetime string
    pub fn datetime(&self) -> String {
        self.time.format(ISO_DATETIME_FORMAT).to_string()
    }
}

/// Rollup width
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[serde(rename = "15min")]
    FifteenMinutes,
    Hourly,
    Daily,
}

impl Granularity {
    /// All maintained granularities, finest first
    pub fn all() -> &'static [Granularity] {
        &[
            Granularity::FifteenMinutes,
            Granularity::Hourly,
            Granularity::Daily,
        ]
    }

    /// Materialized table holding this rollup
    pub fn table(&self) -> &'static str {
        match self {
            Granularity::FifteenMinutes => "measurements_15min",
            Granularity::Hourly => "measurements_hourly",
            Granularity::Daily => "measurements_daily",
        }
    }

    /// Bucket width in seconds
    pub fn bucket_seconds(&self) -> i64 {
        match self {
            Granularity::FifteenMinutes => 15 * 60,
            Granularity::Hourly => 3600,
            Granularity::Daily => 86_400,
        }
    }

    /// Trailing window recomputed on every run unless configured otherwise
    pub fn default_window(&self) -> Duration {
        match self {
            Granularity::FifteenMinutes => Duration::hours(2),
            Granularity::Hourly => Duration::hours(24),
            Granularity::Daily => Duration::days(2),
        }
    }

    /// Start of the bucket containing `time`
    pub fn floor(&self, time: NaiveDateTime) -> NaiveDateTime {
        let secs = time.and_utc().timestamp();
        let width = self.bucket_seconds();
        let floored = secs - secs.rem_euclid(width);
        DateTime::from_timestamp(floored, 0)
            .map(|dt| dt.naive_utc())
            .unwrap_or_else(|| time.with_nanosecond(0).unwrap_or(time))
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Granularity::FifteenMinutes => write!(f, "15min"),
            Granularity::Hourly => write!(f, "hourly"),
            Granularity::Daily => write!(f, "daily"),
        }
    }
}

/// A rollup of measurements over one bucket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateBucket {
    pub station: String,
    pub bucket_start: NaiveDateTime,
    pub granularity: Granularity,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
    /// Rows that exceeded the station's threshold for their time of day
    pub alarm_count: u64,
}

/// Per-table retention rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionPolicy {
    pub table: String,
    pub retention_days: u32,
    #[serde(default)]
    pub last_cleanup: Option<DateTime<Utc>>,
    #[serde(default = "default_policy_enabled")]
    pub enabled: bool,
}

fn default_policy_enabled() -> bool {
    true
}

impl RetentionPolicy {
    pub fn new(table: impl Into<String>, retention_days: u32) -> Self {
        Self {
            table: table.into(),
            retention_days,
            last_cleanup: None,
            enabled: true,
        }
    }

    /// Builder method: disable the policy
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Rows strictly older than this are deleted
    pub fn cutoff(&self, now: NaiveDateTime) -> NaiveDateTime {
        now - Duration::days(self.retention_days as i64)
    }
}

/// A table the store manages and the column its age is measured by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub time_column: &'static str,
}

/// All tables subject to retention
pub const MANAGED_TABLES: &[TableSpec] = &[
    TableSpec {
        name: "measurements",
        time_column: "time",
    },
    TableSpec {
        name: "measurements_15min",
        time_column: "bucket_start",
    },
    TableSpec {
        name: "measurements_hourly",
        time_column: "bucket_start",
    },
    TableSpec {
        name: "measurements_daily",
        time_column: "bucket_start",
    },
];

/// Look up a managed table by name
pub fn table_spec(name: &str) -> Option<TableSpec> {
    MANAGED_TABLES.iter().copied().find(|t| t.name == name)
}

/// Retention policies seeded into an empty store
pub fn default_retention_policies() -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy::new("measurements", 90),
        RetentionPolicy::new("measurements_15min", 180),
        RetentionPolicy::new("measurements_hourly", 730),
        RetentionPolicy::new("measurements_daily", 3650).disabled(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_granularity_floor() {
        assert_eq!(Granularity::FifteenMinutes.floor(dt(10, 44, 59)), dt(10, 30, 0));
        assert_eq!(Granularity::FifteenMinutes.floor(dt(10, 45, 0)), dt(10, 45, 0));
        assert_eq!(Granularity::Hourly.floor(dt(23, 59, 59)), dt(23, 0, 0));
        assert_eq!(Granularity::Daily.floor(dt(13, 1, 2)), dt(0, 0, 0));
    }

    #[test]
    fn test_record_formats() {
        let record = MeasurementRecord::new("ort", dt(7, 5, 3), 55.5);
        assert_eq!(record.time_key(), "2024-03-09 07:05:03");
        assert_eq!(record.datetime(), "2024-03-09T07:05:03");
    }

    #[test]
    fn test_table_spec_lookup() {
        assert_eq!(table_spec("measurements").unwrap().time_column, "time");
        assert_eq!(
            table_spec("measurements_daily").unwrap().time_column,
            "bucket_start"
        );
        assert!(table_spec("sqlite_master").is_none());
    }

    #[test]
    fn test_granularity_serde_names() {
        let json = serde_json::to_string(&Granularity::FifteenMinutes).unwrap();
        assert_eq!(json, "\"15min\"");
        let parsed: Granularity = serde_json::from_str("\"hourly\"").unwrap();
        assert_eq!(parsed, Granularity::Hourly);
    }
}
