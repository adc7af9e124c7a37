//! Per-file ingestion checkpoints
//!
//! Stored as a small JSON side-car next to each source file
//! (`<file>.checkpoint.json`). `last_line` counts data rows after the
//! header that are committed to the store; it only moves forward.
//!
//! Two write modes:
//! - [`Durability::Buffered`]: written while streaming, no fsync
//! - [`Durability::Forced`]: written after the file's transaction commits,
//!   fsynced together with its directory entry
//!
//! Buffered writes only move `staged_line`, never `last_line`, so a crash
//! before commit replays uncommitted rows instead of skipping them.

use crate::ingest::error::{IngestError, IngestResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const SIDECAR_SUFFIX: &str = ".checkpoint.json";

/// Write mode for [`Checkpoint::save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Write through the page cache only
    Buffered,
    /// Fsync file and directory before returning
    Forced,
}

/// Resume position for one source file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Data rows committed to the store
    pub last_line: u64,
    /// When `last_line` last moved
    pub last_processed_at: Option<DateTime<Utc>>,
    /// CRC32 of the header row the checkpoint belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u32>,
    /// Rows read by an attempt that has not committed yet
    #[serde(default)]
    pub staged_line: u64,
}

impl Checkpoint {
    /// Load the checkpoint for `file`, starting from zero when absent
    ///
    /// An unreadable side-car is logged and treated as absent; replay is
    /// safe because inserts are upserts.
    pub fn load(file: &Path) -> IngestResult<Self> {
        let path = sidecar_path(file);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(checkpoint) => Ok(checkpoint),
            Err(e) => {
                tracing::warn!(
                    file = %file.display(),
                    error = %e,
                    "Unreadable checkpoint, restarting from line 0"
                );
                Ok(Self::default())
            }
        }
    }

    /// Persist next to `file`
    pub fn save(&self, file: &Path, durability: Durability) -> IngestResult<()> {
        let path = sidecar_path(file);
        let tmp = path.with_extension("json.tmp");

        {
            let handle = File::create(&tmp)?;
            let mut writer = BufWriter::new(handle);
            serde_json::to_writer(&mut writer, self)
                .map_err(|e| IngestError::Checkpoint(format!("Failed to encode checkpoint: {}", e)))?;
            writer.flush()?;

            if durability == Durability::Forced {
                writer.get_ref().sync_all()?;
            }
        }

        std::fs::rename(&tmp, &path)?;

        if durability == Durability::Forced {
            sync_parent(&path)?;
        }

        Ok(())
    }

    /// Record in-flight progress without moving the committed position
    pub fn stage(&mut self, line: u64) {
        self.staged_line = self.staged_line.max(line);
    }

    /// Move the committed position forward after a successful commit
    pub fn commit(&mut self, line: u64) {
        self.last_line = self.last_line.max(line);
        self.staged_line = self.last_line;
        self.last_processed_at = Some(Utc::now());
    }
}

/// Side-car path for a source file
pub fn sidecar_path(file: &Path) -> PathBuf {
    let mut name = file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(SIDECAR_SUFFIX);
    file.with_file_name(name)
}

/// Whether `path` is a checkpoint side-car (or its temp file)
pub fn is_sidecar(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(SIDECAR_SUFFIX) || n.ends_with(".checkpoint.json.tmp"))
        .unwrap_or(false)
}

/// CRC32 identifying a header row
pub fn header_checksum(headers: &csv::StringRecord) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for (i, field) in headers.iter().enumerate() {
        if i > 0 {
            hasher.update(b";");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize()
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> IngestResult<()> {
    if let Some(parent) = path.parent() {
        let dir = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> IngestResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sidecar_naming() {
        let file = Path::new("/data/ort/2024-03-09.csv");
        assert_eq!(
            sidecar_path(file),
            PathBuf::from("/data/ort/2024-03-09.csv.checkpoint.json")
        );
        assert!(is_sidecar(&sidecar_path(file)));
        assert!(!is_sidecar(file));
    }

    #[test]
    fn test_missing_checkpoint_starts_at_zero() {
        let dir = tempdir().unwrap();
        let checkpoint = Checkpoint::load(&dir.path().join("a.csv")).unwrap();
        assert_eq!(checkpoint, Checkpoint::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.csv");

        let mut checkpoint = Checkpoint::default();
        checkpoint.checksum = Some(42);
        checkpoint.commit(17);
        checkpoint.save(&file, Durability::Forced).unwrap();

        let loaded = Checkpoint::load(&file).unwrap();
        assert_eq!(loaded.last_line, 17);
        assert_eq!(loaded.staged_line, 17);
        assert_eq!(loaded.checksum, Some(42));
        assert!(loaded.last_processed_at.is_some());
        assert!(!sidecar_path(&file).with_extension("json.tmp").exists());
    }

    #[test]
    fn test_stage_does_not_move_committed_line() {
        let mut checkpoint = Checkpoint::default();
        checkpoint.commit(10);
        checkpoint.stage(110);
        assert_eq!(checkpoint.last_line, 10);
        assert_eq!(checkpoint.staged_line, 110);
    }

    #[test]
    fn test_commit_is_monotonic() {
        let mut checkpoint = Checkpoint::default();
        checkpoint.commit(10);
        checkpoint.commit(4);
        assert_eq!(checkpoint.last_line, 10);
    }

    #[test]
    fn test_corrupt_checkpoint_restarts() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.csv");
        std::fs::write(sidecar_path(&file), "{not json").unwrap();

        let checkpoint = Checkpoint::load(&file).unwrap();
        assert_eq!(checkpoint.last_line, 0);
    }

    #[test]
    fn test_header_checksum_changes_with_columns() {
        let a = csv::StringRecord::from(vec!["Systemzeit", "LAeq"]);
        let b = csv::StringRecord::from(vec!["Systemzeit", "LAF"]);
        assert_eq!(header_checksum(&a), header_checksum(&a.clone()));
        assert_ne!(header_checksum(&a), header_checksum(&b));
    }
}
