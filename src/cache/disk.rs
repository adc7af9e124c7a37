//! Disk tier
//!
//! One file per key:
//!
//! ```text
//! ┌──────────────────────────────┬───────────┐
//! │ bincode(DiskEnvelope)        │ CRC32 LE  │
//! │   payload = lz4(json value)  │ (4 bytes) │
//! └──────────────────────────────┴───────────┘
//! ```
//!
//! File name: `<crc32(key) hex>-<urlencoded key prefix>.entry`.

use crate::cache::entry::{CacheEntry, CachePriority};
use crate::cache::error::{CacheError, CacheResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const EXTENSION: &str = "entry";
const PREFIX_CHARS: usize = 32;

#[derive(Serialize, Deserialize)]
struct DiskEnvelope {
    key: String,
    tags: Vec<String>,
    priority: CachePriority,
    explicit_ttl_ms: Option<u64>,
    created_at_ms: i64,
    expires_at_ms: i64,
    hit_count: u64,
    size_bytes: u64,
    payload: Vec<u8>,
}

/// Result of a disk sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub corrupt: usize,
    pub memory_expired: usize,
}

pub struct DiskTier {
    dir: PathBuf,
}

impl DiskTier {
    pub fn open(dir: impl AsRef<Path>) -> CacheResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        let prefix: String = key.chars().take(PREFIX_CHARS).collect();
        self.dir.join(format!(
            "{:08x}-{}.{}",
            crc32fast::hash(key.as_bytes()),
            urlencoding::encode(&prefix),
            EXTENSION
        ))
    }

    pub fn write(&self, entry: &CacheEntry) -> CacheResult<()> {
        let json = serde_json::to_vec(&entry.value)?;
        let envelope = DiskEnvelope {
            key: entry.key.clone(),
            tags: entry.tags.clone(),
            priority: entry.priority,
            explicit_ttl_ms: entry.explicit_ttl.map(|d| d.as_millis() as u64),
            created_at_ms: entry.created_at.timestamp_millis(),
            expires_at_ms: entry.expires_at.timestamp_millis(),
            hit_count: entry.hit_count,
            size_bytes: entry.size_bytes as u64,
            payload: lz4_flex::compress_prepend_size(&json),
        };

        let mut bytes = bincode::serialize(&envelope)?;
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());

        let path = self.path_for(&entry.key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read `key`; `Ok(None)` when absent or when the file belongs to another key
    pub fn read(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let path = self.path_for(key);
        let entry = match Self::read_file(&path) {
            Ok(entry) => entry,
            Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if entry.key != key {
            return Err(CacheError::Corrupt {
                file: path.display().to_string(),
                reason: format!("holds key {:?}", entry.key),
            });
        }
        Ok(Some(entry))
    }

    fn read_file(path: &Path) -> CacheResult<CacheEntry> {
        let bytes = fs::read(path)?;
        let corrupt = |reason: String| CacheError::Corrupt {
            file: path.display().to_string(),
            reason,
        };

        if bytes.len() < 4 {
            return Err(corrupt("truncated".to_string()));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(corrupt(format!(
                "checksum mismatch: stored {:08x}, computed {:08x}",
                stored, computed
            )));
        }

        let envelope: DiskEnvelope =
            bincode::deserialize(body).map_err(|e| corrupt(e.to_string()))?;
        let json = lz4_flex::decompress_size_prepended(&envelope.payload)
            .map_err(|e| corrupt(e.to_string()))?;
        let value = serde_json::from_slice(&json).map_err(|e| corrupt(e.to_string()))?;

        Ok(CacheEntry {
            key: envelope.key,
            value,
            tags: envelope.tags,
            priority: envelope.priority,
            explicit_ttl: envelope.explicit_ttl_ms.map(Duration::from_millis),
            created_at: from_millis(envelope.created_at_ms),
            expires_at: from_millis(envelope.expires_at_ms),
            hit_count: envelope.hit_count,
            size_bytes: envelope.size_bytes as usize,
        })
    }

    /// Delete the file for `key`, returning whether it existed
    pub fn remove(&self, key: &str) -> CacheResult<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn entry_files(&self) -> CacheResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Readable entries; unreadable files are skipped
    pub fn scan(&self) -> CacheResult<Vec<CacheEntry>> {
        Ok(self
            .entry_files()?
            .iter()
            .filter_map(|p| Self::read_file(p).ok())
            .collect())
    }

    pub fn len(&self) -> CacheResult<usize> {
        Ok(self.entry_files()?.len())
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Delete expired and unreadable files
    pub fn sweep(&self, now: DateTime<Utc>) -> CacheResult<SweepReport> {
        let mut report = SweepReport::default();
        for path in self.entry_files()? {
            match Self::read_file(&path) {
                Ok(entry) if entry.is_expired(now) => {
                    fs::remove_file(&path)?;
                    report.expired += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(file = %path.display(), error = %e, "Removing unreadable cache file");
                    fs::remove_file(&path)?;
                    report.corrupt += 1;
                }
            }
        }
        Ok(report)
    }

    pub fn clear(&self) -> CacheResult<usize> {
        let files = self.entry_files()?;
        for path in &files {
            fs::remove_file(path)?;
        }
        Ok(files.len())
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(key: &str, ttl_secs: i64) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            key: key.to_string(),
            value: serde_json::json!({"a": 1, "list": [1, 2, 3]}),
            tags: vec!["station_ort".to_string()],
            priority: CachePriority::High,
            explicit_ttl: Some(Duration::from_secs(5)),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
            hit_count: 7,
            size_bytes: 24,
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let tier = DiskTier::open(dir.path()).unwrap();
        let original = entry("agg:hourly:ort", 60);
        tier.write(&original).unwrap();

        let loaded = tier.read("agg:hourly:ort").unwrap().unwrap();
        assert_eq!(loaded.value, original.value);
        assert_eq!(loaded.tags, original.tags);
        assert_eq!(loaded.hit_count, 7);
        assert_eq!(loaded.explicit_ttl, Some(Duration::from_secs(5)));
        assert_eq!(
            loaded.expires_at.timestamp_millis(),
            original.expires_at.timestamp_millis()
        );
        assert!(tier.read("agg:hourly:other").unwrap().is_none());
    }

    #[test]
    fn test_file_name_is_safe() {
        let dir = tempdir().unwrap();
        let tier = DiskTier::open(dir.path()).unwrap();
        let path = tier.path_for("history:ort/2024 03");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(!name.contains('/'));
        assert!(!name.contains(' '));
        assert!(name.ends_with(".entry"));
    }

    #[test]
    fn test_corrupt_file_is_reported_and_swept() {
        let dir = tempdir().unwrap();
        let tier = DiskTier::open(dir.path()).unwrap();
        tier.write(&entry("k1", 60)).unwrap();

        let path = tier.path_for("k1");
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(tier.read("k1"), Err(CacheError::Corrupt { .. })));

        let report = tier.sweep(Utc::now()).unwrap();
        assert_eq!(report.corrupt, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_sweep_removes_expired() {
        let dir = tempdir().unwrap();
        let tier = DiskTier::open(dir.path()).unwrap();
        tier.write(&entry("old", -1)).unwrap();
        tier.write(&entry("fresh", 60)).unwrap();

        let report = tier.sweep(Utc::now()).unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(tier.len().unwrap(), 1);
        assert_eq!(tier.scan().unwrap()[0].key, "fresh");

        assert_eq!(tier.clear().unwrap(), 1);
        assert!(tier.is_empty().unwrap());
    }
}
