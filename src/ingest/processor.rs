//! Row Processor - checkpointed ingestion of one station file
//!
//! ```text
//! load checkpoint → open file up to its last newline → verify header checksum
//!   → skip last_line rows
//!   → normalize row → upsert (busy retry) → every N rows: stage + buffered save
//!   → COMMIT → commit checkpoint + forced save → invalidate station tag
//! ```
//!
//! Blocking throughout; the coordinator runs it on the blocking pool.

use crate::cache::{station_tag, InvalidationSink};
use crate::ingest::checkpoint::{header_checksum, Checkpoint, Durability};
use crate::ingest::error::{IngestError, IngestResult};
use crate::ingest::row::{ColumnConfig, RowContext, RowSchema};
use crate::storage::{MeasurementRecord, MeasurementStore, StorageResult};
use chrono::{DateTime, Local};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Row processor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub columns: ColumnConfig,

    /// Field delimiter
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Rows between buffered checkpoint writes
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,

    /// Whole-file attempts before the file is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between whole-file attempts
    #[serde(default = "default_retry_delay", with = "millis")]
    pub retry_delay: Duration,

    /// Retries of a single insert on a busy store
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,

    /// Base delay between busy retries
    #[serde(default = "default_busy_backoff", with = "millis")]
    pub busy_backoff: Duration,
}

fn default_delimiter() -> char {
    ';'
}

fn default_checkpoint_every() -> u64 {
    100
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_busy_retries() -> u32 {
    5
}

fn default_busy_backoff() -> Duration {
    Duration::from_millis(10)
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            columns: ColumnConfig::default(),
            delimiter: default_delimiter(),
            checkpoint_every: default_checkpoint_every(),
            max_attempts: default_max_attempts(),
            retry_delay: default_retry_delay(),
            busy_retries: default_busy_retries(),
            busy_backoff: default_busy_backoff(),
        }
    }
}

/// Durations in config files are plain milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Result of processing one file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileOutcome {
    pub station: String,
    pub file: String,
    /// Rows written to the store
    pub inserted: u64,
    /// Rows rejected by validation
    pub skipped: u64,
    /// Valid rows that could not be written; the checkpoint stays before the first
    pub errors: u64,
    /// Committed position before this run
    pub start_line: u64,
    /// Committed position after this run
    pub end_line: u64,
    pub duration_ms: u64,
    /// The checkpoint was discarded because the header changed
    pub restarted: bool,
}

/// Streams station files into the store
pub struct RowProcessor {
    store: Arc<MeasurementStore>,
    config: ProcessorConfig,
    invalidator: Option<Arc<dyn InvalidationSink>>,
}

impl RowProcessor {
    pub fn new(store: Arc<MeasurementStore>, config: ProcessorConfig) -> Self {
        Self {
            store,
            config,
            invalidator: None,
        }
    }

    /// Builder method: signal cache invalidation after each successful file
    pub fn with_invalidation(mut self, sink: Arc<dyn InvalidationSink>) -> Self {
        self.invalidator = Some(sink);
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Process `path` for `station`, retrying whole-file failures
    pub fn process_file(&self, station: &str, path: &Path) -> IngestResult<FileOutcome> {
        self.process_file_with_progress(station, path, |_| {})
    }

    /// Like [`process_file`](Self::process_file), reporting rows consumed so far
    pub fn process_file_with_progress<F>(
        &self,
        station: &str,
        path: &Path,
        on_progress: F,
    ) -> IngestResult<FileOutcome>
    where
        F: Fn(u64),
    {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.process_once(station, path, &on_progress) {
                Ok(outcome) if outcome.errors > 0 && attempt < attempts => {
                    tracing::warn!(
                        station = %station,
                        file = %path.display(),
                        attempt,
                        max_attempts = attempts,
                        errors = outcome.errors,
                        end_line = outcome.end_line,
                        "Rows left unwritten by a busy store, replaying from checkpoint"
                    );
                    std::thread::sleep(backoff(self.config.retry_delay, attempt));
                }
                Ok(outcome) => {
                    tracing::info!(
                        station = %station,
                        file = %path.display(),
                        inserted = outcome.inserted,
                        skipped = outcome.skipped,
                        errors = outcome.errors,
                        end_line = outcome.end_line,
                        attempt,
                        "File processed"
                    );
                    self.invalidate(station);
                    return Ok(outcome);
                }
                Err(IngestError::FileNotFound(p)) => return Err(IngestError::FileNotFound(p)),
                Err(e) => {
                    tracing::warn!(
                        station = %station,
                        file = %path.display(),
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "File processing attempt failed"
                    );
                    last_error = Some(e);

                    if attempt < attempts {
                        std::thread::sleep(backoff(self.config.retry_delay, attempt));
                    }
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        tracing::error!(
            station = %station,
            file = %path.display(),
            attempts,
            error = %last_error,
            "Giving up on file"
        );

        Err(IngestError::AttemptsExhausted {
            path: path.to_path_buf(),
            attempts,
            last_error,
        })
    }

    fn process_once(
        &self,
        station: &str,
        path: &Path,
        on_progress: &dyn Fn(u64),
    ) -> IngestResult<FileOutcome> {
        let started = Instant::now();

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IngestError::FileNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        let fallback_date = file
            .metadata()
            .and_then(|m| m.modified())
            .map(|t| DateTime::<Local>::from(t).date_naive())
            .unwrap_or_else(|_| Local::now().date_naive());

        let mut checkpoint = Checkpoint::load(path)?;

        // a station may still be writing the last line
        let complete = terminated_len(&mut file)?;
        if complete == 0 {
            tracing::debug!(
                station = %station,
                file = %path.display(),
                "No complete line yet, nothing to read"
            );
            return Ok(FileOutcome {
                station: station.to_string(),
                file: path.display().to_string(),
                inserted: 0,
                skipped: 0,
                errors: 0,
                start_line: checkpoint.last_line,
                end_line: checkpoint.last_line,
                duration_ms: started.elapsed().as_millis() as u64,
                restarted: false,
            });
        }

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter_byte())
            .has_headers(true)
            .flexible(true)
            .from_reader(BufReader::new(file.take(complete)));

        let headers = reader.headers()?.clone();
        let checksum = header_checksum(&headers);

        let mut restarted = false;
        if checkpoint.checksum.is_some_and(|c| c != checksum) {
            tracing::warn!(
                station = %station,
                file = %path.display(),
                line = checkpoint.last_line,
                "Header changed, restarting file from line 0"
            );
            checkpoint = Checkpoint::default();
            restarted = true;
        }
        checkpoint.checksum = Some(checksum);

        let schema = RowSchema::from_headers(&headers, &self.config.columns);
        if !schema.has_time_column() || !schema.has_value_column() {
            tracing::warn!(
                station = %station,
                file = %path.display(),
                "Header lacks time or value column, every row will be skipped"
            );
        }

        let ctx = RowContext {
            station: station.to_string(),
            source_file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            fallback_date,
        };

        let start_line = checkpoint.last_line;
        let every = self.config.checkpoint_every.max(1);
        let mut line = 0u64;
        let mut inserted = 0u64;
        let mut skipped = 0u64;
        let mut errors = 0u64;
        // rows from the first unwritten one onwards stay below the checkpoint
        let mut held_at: Option<u64> = None;

        let mut conn = self.store.connect()?;
        let tx = conn.transaction()?;
        let mut row = csv::StringRecord::new();

        while reader.read_record(&mut row)? {
            line += 1;
            if line <= start_line {
                continue;
            }

            match schema.normalize(&row, &ctx) {
                Ok(record) => match self.upsert_with_retry(&tx, &record) {
                    Ok(()) => inserted += 1,
                    Err(e) if e.is_busy() => {
                        errors += 1;
                        held_at.get_or_insert(line - 1);
                        tracing::error!(
                            station = %station,
                            file = %path.display(),
                            line,
                            retries = self.config.busy_retries,
                            error = %e,
                            "Store stayed busy, row not written"
                        );
                    }
                    Err(e) => return Err(e.into()),
                },
                Err(reason) => {
                    skipped += 1;
                    tracing::debug!(
                        station = %station,
                        file = %path.display(),
                        line,
                        reason = %reason,
                        "Row skipped"
                    );
                }
            }

            let consumed = line - start_line;
            if consumed % every == 0 {
                checkpoint.stage(held_at.unwrap_or(line));
                checkpoint.save(path, Durability::Buffered)?;
                on_progress(consumed);
            }
        }

        tx.commit()?;

        checkpoint.commit(held_at.unwrap_or(line));
        checkpoint.save(path, Durability::Forced)?;
        on_progress(line.saturating_sub(start_line));

        Ok(FileOutcome {
            station: station.to_string(),
            file: path.display().to_string(),
            inserted,
            skipped,
            errors,
            start_line,
            end_line: checkpoint.last_line,
            duration_ms: started.elapsed().as_millis() as u64,
            restarted,
        })
    }

    fn upsert_with_retry(&self, conn: &Connection, record: &MeasurementRecord) -> StorageResult<()> {
        let mut attempt = 0;
        loop {
            match MeasurementStore::upsert(conn, record) {
                Err(e) if e.is_busy() && attempt < self.config.busy_retries => {
                    attempt += 1;
                    tracing::trace!(
                        station = %record.station,
                        attempt,
                        "Store busy, retrying insert"
                    );
                    std::thread::sleep(backoff(self.config.busy_backoff, attempt));
                }
                result => return result,
            }
        }
    }

    fn delimiter_byte(&self) -> u8 {
        if self.config.delimiter.is_ascii() {
            self.config.delimiter as u8
        } else {
            b';'
        }
    }

    fn invalidate(&self, station: &str) {
        if let Some(sink) = &self.invalidator {
            let removed = sink.invalidate_tags(&[station_tag(station)]);
            tracing::debug!(station = %station, removed, "Invalidated station cache entries");
        }
    }
}

/// Length of `file` up to and including its last newline, rewound to the start
fn terminated_len(file: &mut File) -> std::io::Result<u64> {
    const CHUNK: u64 = 4096;
    let len = file.metadata()?.len();
    let mut end = len;
    let mut buf = vec![0u8; CHUNK as usize];

    let complete = loop {
        if end == 0 {
            break 0;
        }
        let start = end.saturating_sub(CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            break start + pos as u64 + 1;
        }
        end = start;
    };

    file.seek(SeekFrom::Start(0))?;
    Ok(complete)
}

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ...
pub(crate) fn backoff(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift)
}
