//! Row validation and normalization
//!
//! Station files are semicolon-delimited with a header row. A row becomes a
//! [`MeasurementRecord`] when:
//! - the system-time field decomposes into `H:M:S` (normalized to `HH:MM:SS`)
//! - one of the recognized value columns holds a plausible number
//!   (comma accepted as decimal point)
//! - a date can be derived from the date column, the alternate date column,
//!   or, failing both, the file's modification date

use crate::ingest::error::RowError;
use crate::storage::MeasurementRecord;
use chrono::{NaiveDate, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Recognized column names and value bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    /// Required time-of-day column
    #[serde(default = "default_time_column")]
    pub time_column: String,
    /// Value columns in preference order
    #[serde(default = "default_value_columns")]
    pub value_columns: Vec<String>,
    /// Date column in `DD.MM.YYYY`
    #[serde(default = "default_date_column")]
    pub date_column: String,
    /// Alternate date column in `YYYY-MM-DD`
    #[serde(default = "default_alt_date_column")]
    pub alt_date_column: String,
    /// Smallest plausible value (inclusive)
    #[serde(default = "default_min_value")]
    pub min_value: f64,
    /// Largest plausible value (inclusive)
    #[serde(default = "default_max_value")]
    pub max_value: f64,
}

fn default_time_column() -> String {
    "Systemzeit".to_string()
}

fn default_value_columns() -> Vec<String> {
    ["LAeq", "LAFeq", "LAF", "LAFmax", "Wert"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_date_column() -> String {
    "Datum".to_string()
}

fn default_alt_date_column() -> String {
    "Date".to_string()
}

fn default_min_value() -> f64 {
    0.0
}

fn default_max_value() -> f64 {
    200.0
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            time_column: default_time_column(),
            value_columns: default_value_columns(),
            date_column: default_date_column(),
            alt_date_column: default_alt_date_column(),
            min_value: default_min_value(),
            max_value: default_max_value(),
        }
    }
}

/// Per-file context attached to every record
#[derive(Debug, Clone)]
pub struct RowContext {
    pub station: String,
    pub source_file: String,
    /// Date used when the row carries none
    pub fallback_date: NaiveDate,
}

/// Column positions resolved from one header row
#[derive(Debug, Clone)]
pub struct RowSchema {
    headers: Vec<String>,
    time_column: String,
    time_idx: Option<usize>,
    value_idx: Vec<usize>,
    date_idx: Option<usize>,
    alt_date_idx: Option<usize>,
    min_value: f64,
    max_value: f64,
}

impl RowSchema {
    /// Resolve column positions (case-insensitive, BOM tolerant)
    pub fn from_headers(headers: &csv::StringRecord, columns: &ColumnConfig) -> Self {
        let headers: Vec<String> = headers
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();

        let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name.trim()));

        Self {
            time_idx: find(&columns.time_column),
            value_idx: columns.value_columns.iter().filter_map(|c| find(c)).collect(),
            date_idx: find(&columns.date_column),
            alt_date_idx: find(&columns.alt_date_column),
            time_column: columns.time_column.clone(),
            min_value: columns.min_value,
            max_value: columns.max_value,
            headers,
        }
    }

    /// Whether the header carries the required time column
    pub fn has_time_column(&self) -> bool {
        self.time_idx.is_some()
    }

    /// Whether the header carries any recognized value column
    pub fn has_value_column(&self) -> bool {
        !self.value_idx.is_empty()
    }

    /// Validate one row and turn it into a record
    pub fn normalize(
        &self,
        record: &csv::StringRecord,
        ctx: &RowContext,
    ) -> Result<MeasurementRecord, RowError> {
        let raw_time = self
            .field(record, self.time_idx)
            .ok_or_else(|| RowError::MissingField(self.time_column.clone()))?;
        let time = normalize_time(raw_time)?;

        let raw_value = self
            .value_idx
            .iter()
            .find_map(|idx| self.field(record, Some(*idx)))
            .ok_or_else(|| RowError::MissingField("value".to_string()))?;
        let value = parse_decimal(raw_value)?;
        if value < self.min_value || value > self.max_value {
            return Err(RowError::OutOfRangeValue(value));
        }

        let date = if let Some(raw) = self.field(record, self.date_idx) {
            parse_dotted_date(raw)?
        } else if let Some(raw) = self.field(record, self.alt_date_idx) {
            parse_alt_date(raw)?
        } else {
            ctx.fallback_date
        };

        Ok(MeasurementRecord::new(ctx.station.clone(), date.and_time(time), value)
            .source_file(ctx.source_file.clone())
            .raw_fields(self.raw_fields(record)))
    }

    fn field<'r>(&self, record: &'r csv::StringRecord, idx: Option<usize>) -> Option<&'r str> {
        idx.and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn raw_fields(&self, record: &csv::StringRecord) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), serde_json::Value::String(v.trim().to_string())))
            .collect();
        serde_json::Value::Object(map)
    }
}

fn time_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{1,2}):(\d{1,2}):(\d{1,2})(?:[.,]\d+)?$").expect("valid time pattern")
    })
}

/// Decompose `H:M:S` into a zero-padded time of day
pub fn normalize_time(raw: &str) -> Result<NaiveTime, RowError> {
    let malformed = || RowError::MalformedTimestamp(raw.to_string());
    let caps = time_pattern().captures(raw.trim()).ok_or_else(malformed)?;

    let part = |i: usize| -> Result<u32, RowError> {
        caps.get(i)
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(malformed)
    };

    NaiveTime::from_hms_opt(part(1)?, part(2)?, part(3)?).ok_or_else(malformed)
}

/// Parse a decimal that may use a comma as decimal point
pub fn parse_decimal(raw: &str) -> Result<f64, RowError> {
    let normalized = raw.trim().replace(',', ".");
    match normalized.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(RowError::InvalidValue(raw.to_string())),
    }
}

/// `DD.MM.YYYY`
fn parse_dotted_date(raw: &str) -> Result<NaiveDate, RowError> {
    NaiveDate::parse_from_str(raw, "%d.%m.%Y")
        .map_err(|_| RowError::MalformedTimestamp(raw.to_string()))
}

/// `YYYY-MM-DD`, tolerating the dotted form
fn parse_alt_date(raw: &str) -> Result<NaiveDate, RowError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d.%m.%Y"))
        .map_err(|_| RowError::MalformedTimestamp(raw.to_string()))
}
