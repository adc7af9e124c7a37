//! Configuration System
//!
//! Loads a TOML file from the default locations and applies `STATIONFLOW_`
//! environment overrides. [`Config::validate`] rejects impossible values
//! before any component is built.

use crate::aggregation::AggregationConfig;
use crate::api::ApiConfig;
use crate::cache::CacheConfig;
use crate::coordinator::CoordinatorConfig;
use crate::ingest::ProcessorConfig;
use crate::scheduler::ScheduleConfig;
use crate::storage::{table_spec, Granularity, RetentionPolicy};
use crate::watcher::{StationDir, WatcherConfig};
use crate::weather::WeatherConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "STATIONFLOW_";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub stations: Vec<StationDir>,

    #[serde(default)]
    pub ingest: ProcessorConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub aggregation: AggregationSettings,

    /// Overrides for the seeded retention policies
    #[serde(default)]
    pub retention: Vec<RetentionPolicy>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    pub weather: Option<WeatherConfig>,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Measurement store location
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Database file; `<data_dir>/stationflow.db` when unset
    pub db_path: Option<String>,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("stationflow").to_string_lossy().to_string())
        .unwrap_or_else(|| "./stationflow_data".to_string())
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StorageSettings {
    pub fn db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(path) => PathBuf::from(path),
            None => Path::new(&self.data_dir).join("stationflow.db"),
        }
    }
}

/// Trailing windows recomputed on each aggregation run
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationSettings {
    #[serde(default = "default_window_15min_minutes")]
    pub window_15min_minutes: i64,

    #[serde(default = "default_window_hourly_hours")]
    pub window_hourly_hours: i64,

    #[serde(default = "default_window_daily_days")]
    pub window_daily_days: i64,

    /// Deleted rows from which retention compacts the store
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: usize,
}

fn default_window_15min_minutes() -> i64 {
    120
}

fn default_window_hourly_hours() -> i64 {
    24
}

fn default_window_daily_days() -> i64 {
    2
}

fn default_compaction_threshold() -> usize {
    10_000
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            window_15min_minutes: default_window_15min_minutes(),
            window_hourly_hours: default_window_hourly_hours(),
            window_daily_days: default_window_daily_days(),
            compaction_threshold: default_compaction_threshold(),
        }
    }
}

impl AggregationSettings {
    pub fn to_engine_config(&self) -> AggregationConfig {
        let windows = [
            (
                Granularity::FifteenMinutes,
                chrono::Duration::minutes(self.window_15min_minutes),
            ),
            (
                Granularity::Hourly,
                chrono::Duration::hours(self.window_hourly_hours),
            ),
            (
                Granularity::Daily,
                chrono::Duration::days(self.window_daily_days),
            ),
        ];
        AggregationConfig {
            windows: windows.into_iter().collect(),
            compaction_threshold: self.compaction_threshold,
        }
    }
}

/// Schedules of the built-in jobs
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_aggregate_schedule")]
    pub aggregate: ScheduleConfig,

    #[serde(default = "default_retention_schedule")]
    pub retention: ScheduleConfig,

    #[serde(default = "default_warmup_schedule")]
    pub cache_warmup: ScheduleConfig,

    /// Trigger an aggregation run whenever an import completes
    #[serde(default = "default_aggregate_on_import")]
    pub aggregate_on_import: bool,
}

fn default_aggregate_schedule() -> ScheduleConfig {
    ScheduleConfig::new(300, 240)
}

fn default_retention_schedule() -> ScheduleConfig {
    ScheduleConfig::new(86_400, 3600)
}

fn default_warmup_schedule() -> ScheduleConfig {
    ScheduleConfig::new(600, 120)
}

fn default_aggregate_on_import() -> bool {
    true
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            aggregate: default_aggregate_schedule(),
            retention: default_retention_schedule(),
            cache_warmup: default_warmup_schedule(),
            aggregate_on_import: default_aggregate_on_import(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from the first default location that exists, else defaults
    pub fn load_default() -> Result<Self, ConfigError> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("stationflow").join("config.toml")),
            Some(PathBuf::from("/etc/stationflow/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                let config = Self::load_with_env(path)?;
                tracing::info!(path = %path.display(), "Loaded config");
                return Ok(config);
            }
        }

        tracing::info!("Using default config with environment overrides");
        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `STATIONFLOW_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(data_dir) = lookup("DATA_DIR") {
            self.storage.data_dir = data_dir;
        }
        if let Some(db_path) = lookup("DB_PATH") {
            self.storage.db_path = Some(db_path);
        }
        if let Some(cache_dir) = lookup("CACHE_DIR") {
            self.cache.dir = PathBuf::from(cache_dir);
        }
        if let Some(host) = lookup("API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = lookup("API_PORT") {
            match port.parse() {
                Ok(p) => self.api.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid API port override"),
            }
        }
        if let Some(max) = lookup("MAX_CONCURRENT") {
            match max.parse() {
                Ok(n) => self.coordinator.max_concurrent = n,
                Err(_) => tracing::warn!(value = %max, "Ignoring invalid concurrency override"),
            }
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.max_concurrent == 0 {
            return Err(invalid("coordinator.max_concurrent must be at least 1"));
        }
        if self.coordinator.extension.trim().is_empty() {
            return Err(invalid("coordinator.extension must not be empty"));
        }

        let columns = &self.ingest.columns;
        if columns.value_columns.iter().all(|c| c.trim().is_empty()) {
            return Err(invalid("ingest.columns.value_columns must name at least one column"));
        }
        if columns.time_column.trim().is_empty() {
            return Err(invalid("ingest.columns.time_column must not be empty"));
        }
        if columns.min_value > columns.max_value {
            return Err(invalid(format!(
                "ingest.columns bounds are inverted ({} > {})",
                columns.min_value, columns.max_value
            )));
        }
        if self.ingest.checkpoint_every == 0 || self.ingest.max_attempts == 0 {
            return Err(invalid(
                "ingest.checkpoint_every and ingest.max_attempts must be at least 1",
            ));
        }

        let mut names = HashSet::new();
        for station in &self.stations {
            if station.name.trim().is_empty() {
                return Err(invalid("station name must not be empty"));
            }
            if !names.insert(station.name.as_str()) {
                return Err(invalid(format!("duplicate station '{}'", station.name)));
            }
        }

        for policy in &self.retention {
            if table_spec(&policy.table).is_none() {
                return Err(invalid(format!(
                    "unknown retention table '{}'",
                    policy.table
                )));
            }
        }

        let agg = &self.aggregation;
        if agg.window_15min_minutes <= 0 || agg.window_hourly_hours <= 0 || agg.window_daily_days <= 0 {
            return Err(invalid("aggregation windows must be positive"));
        }

        for (name, schedule) in [
            ("aggregate", &self.scheduler.aggregate),
            ("retention", &self.scheduler.retention),
            ("cache_warmup", &self.scheduler.cache_warmup),
        ] {
            if schedule.interval_secs == 0 || schedule.timeout_secs == 0 {
                return Err(invalid(format!(
                    "scheduler.{} interval and timeout must be positive",
                    name
                )));
            }
        }

        if self.cache.max_items == 0 {
            return Err(invalid("cache.max_items must be at least 1"));
        }

        if let Some(weather) = &self.weather {
            weather
                .validate()
                .map_err(|e| invalid(format!("weather: {}", e)))?;
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(invalid(format!(
                "logging.format must be pretty or json, got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# stationflow configuration
#
# Environment variables override these settings:
# - STATIONFLOW_DATA_DIR
# - STATIONFLOW_DB_PATH
# - STATIONFLOW_CACHE_DIR
# - STATIONFLOW_API_HOST
# - STATIONFLOW_API_PORT
# - STATIONFLOW_MAX_CONCURRENT
# - STATIONFLOW_LOG_LEVEL
# - STATIONFLOW_LOG_FORMAT

[storage]
# data_dir = "/var/lib/stationflow"
# db_path = "/var/lib/stationflow/stationflow.db"
busy_timeout_ms = 5000

# One entry per measuring station
# [[stations]]
# name = "station_a"
# directory = "/data/incoming/station_a"

[ingest]
delimiter = ";"
# Rows between checkpoint writes
checkpoint_every = 100
# Whole-file attempts and base delay between them (ms)
max_attempts = 3
retry_delay = 500
# Retries of a single row while the store is locked
busy_retries = 5
busy_backoff = 10

[ingest.columns]
time_column = "Systemzeit"
# First present column wins
value_columns = ["LAeq", "LAFeq", "LAF", "LAFmax", "Wert"]
date_column = "Datum"
alt_date_column = "Date"
min_value = 0.0
max_value = 200.0

[coordinator]
# Defaults to half the available CPUs, at least 2
# max_concurrent = 4
history_size = 200
extension = "csv"

[watcher]
debounce_ms = 1500
restart_delay_ms = 5000
scan_on_start = true

[aggregation]
window_15min_minutes = 120
window_hourly_hours = 24
window_daily_days = 2
compaction_threshold = 10000

# Overrides for the default retention policies
# [[retention]]
# table = "measurements"
# retention_days = 90

[cache]
# dir = "~/.cache/stationflow"
max_items = 1000
max_memory_bytes = 52428800
demote_threshold = 3
sweep_interval_secs = 600

[cache.ttl]
realtime_secs = 30
aggregate_secs = 300
historical_secs = 3600
hot_threshold = 10
hot_ttl_factor = 4

[scheduler]
aggregate_on_import = true

[scheduler.aggregate]
interval_secs = 300
timeout_secs = 240

[scheduler.retention]
interval_secs = 86400
timeout_secs = 3600

[scheduler.cache_warmup]
interval_secs = 600
timeout_secs = 120

# Optional current-weather source
# [weather]
# url_template = "https://weather.example.com/current/{station}"
# timeout_ms = 5000

[api]
enabled = true
host = "127.0.0.1"
port = 8085

[logging]
# Log level: trace, debug, info, warn, error
level = "info"
# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_generated_config_parses_and_validates() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.ingest.checkpoint_every, 100);
        assert_eq!(config.ingest.columns.value_columns[0], "LAeq");
        assert_eq!(config.scheduler.aggregate.interval_secs, 300);
        assert_eq!(config.api.port, 8085);
        assert!(config.weather.is_none());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert!(config.stations.is_empty());
        assert_eq!(config.cache.max_items, 1000);
        assert!(config.coordinator.max_concurrent >= 2);
    }

    #[test]
    fn test_load_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[storage]
data_dir = "/srv/flow"

[[stations]]
name = "nord"
directory = "/srv/in/nord"

[[retention]]
table = "measurements"
retention_days = 30

[weather]
url_template = "http://localhost:9000/w/{station}"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.storage.db_path(), PathBuf::from("/srv/flow/stationflow.db"));
        assert_eq!(config.stations[0].name, "nord");
        assert_eq!(config.retention[0].retention_days, 30);
        assert!(config.retention[0].enabled);
        assert_eq!(config.weather.unwrap().timeout_ms, 5000);
    }

    #[test]
    fn test_load_reports_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[storage\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DB_PATH", "/tmp/x.db"),
            ("API_PORT", "9999"),
            ("MAX_CONCURRENT", "7"),
            ("LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.storage.db_path(), PathBuf::from("/tmp/x.db"));
        assert_eq!(config.api.port, 9999);
        assert_eq!(config.coordinator.max_concurrent, 7);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_invalid_port_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|name| (name == "API_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.api.port, 8085);
    }

    #[test]
    fn test_validate_rejects_impossible_values() {
        let mut config = Config::default();
        config.coordinator.max_concurrent = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.ingest.columns.value_columns.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ingest.columns.min_value = 250.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retention.push(RetentionPolicy::new("measurements_weekly", 10));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.weather = Some(WeatherConfig {
            url_template: "no placeholder".to_string(),
            timeout_ms: 100,
        });
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stations = vec![
            StationDir {
                name: "a".into(),
                directory: "/x".into(),
            },
            StationDir {
                name: "a".into(),
                directory: "/y".into(),
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_aggregation_windows() {
        let engine = AggregationSettings::default().to_engine_config();
        assert_eq!(
            engine.windows[&Granularity::FifteenMinutes],
            chrono::Duration::hours(2)
        );
        assert_eq!(engine.windows[&Granularity::Daily], chrono::Duration::days(2));
        assert_eq!(engine.compaction_threshold, 10_000);
    }
}
