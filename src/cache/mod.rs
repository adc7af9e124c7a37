//! Intelligent Cache
//!
//! Two tiers behind one lock:
//! - **memory**: bounded by item count and serialized bytes, LRU eviction;
//!   hot victims are demoted to disk instead of dropped
//! - **disk**: unbounded, one checksummed file per key, swept periodically
//!
//! A tag → keys reverse index drives bulk invalidation. Reads are not
//! strongly consistent: writers invalidate by tag after changing data.

pub mod disk;
pub mod entry;
pub mod error;
pub mod memory;
pub mod ttl;
pub mod warmup;

pub use disk::{DiskTier, SweepReport};
pub use entry::{CacheEntry, CachePriority, SetOptions};
pub use error::{CacheError, CacheResult};
pub use memory::MemoryTier;
pub use ttl::{Namespace, TtlPolicy};
pub use warmup::{CacheWarmer, WarmReport};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Tag attached to every aggregate-derived entry
pub const AGGREGATES_TAG: &str = "aggregates";

/// Tag covering everything derived from one station's data
pub fn station_tag(station: &str) -> String {
    format!("station_{}", station)
}

/// Receiver of "data changed" signals from writers
pub trait InvalidationSink: Send + Sync {
    /// Drop everything carrying any of `tags`, returning how many entries went
    fn invalidate_tags(&self, tags: &[String]) -> usize;
}

/// Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory of the disk tier
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_max_items")]
    pub max_items: usize,

    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,

    /// LRU victims with more hits than this are demoted to disk
    #[serde(default = "default_demote_threshold")]
    pub demote_threshold: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default)]
    pub ttl: TtlPolicy,
}

fn default_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("stationflow"))
        .unwrap_or_else(|| PathBuf::from("./cache"))
}

fn default_max_items() -> usize {
    1000
}

fn default_max_memory_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_demote_threshold() -> u64 {
    3
}

fn default_sweep_interval_secs() -> u64 {
    600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            max_items: default_max_items(),
            max_memory_bytes: default_max_memory_bytes(),
            demote_threshold: default_demote_threshold(),
            sweep_interval_secs: default_sweep_interval_secs(),
            ttl: TtlPolicy::default(),
        }
    }
}

impl CacheConfig {
    /// Config with the disk tier under `dir`
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }
}

/// Counters since start
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub evictions: u64,
    pub demotions: u64,
    pub promotions: u64,
    pub invalidations: u64,
    pub memory_entries: usize,
    pub memory_bytes: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    evictions: AtomicU64,
    demotions: AtomicU64,
    promotions: AtomicU64,
    invalidations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Inner {
    memory: MemoryTier,
    tags: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn index(&mut self, entry: &CacheEntry) {
        for tag in &entry.tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(entry.key.clone());
        }
    }

    fn unindex(&mut self, key: &str, tags: &[String]) {
        for tag in tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }
}

/// Two-tier, tag-invalidated cache
pub struct IntelligentCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
    disk: DiskTier,
    counters: Counters,
}

impl IntelligentCache {
    /// Open the cache, re-indexing tags of entries already on disk
    pub fn open(config: CacheConfig) -> CacheResult<Self> {
        let disk = DiskTier::open(&config.dir)?;
        let mut inner = Inner {
            memory: MemoryTier::new(config.max_items, config.max_memory_bytes),
            tags: HashMap::new(),
        };

        let existing = disk.scan()?;
        for entry in &existing {
            inner.index(entry);
        }

        tracing::debug!(
            dir = %config.dir.display(),
            disk_entries = existing.len(),
            "Cache opened"
        );

        Ok(Self {
            config,
            inner: Mutex::new(inner),
            disk,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| CacheError::Lock(format!("Failed to acquire cache lock: {}", e)))
    }

    /// Look up `key`, memory first, then disk (promoting on hit)
    pub fn get(&self, key: &str) -> CacheResult<Option<serde_json::Value>> {
        let now = Utc::now();
        let policy = &self.config.ttl;
        let mut inner = self.lock()?;

        if let Some(entry) = inner.memory.get_mut(key) {
            if !entry.is_expired(now) {
                entry.hit_count += 1;
                if entry.explicit_ttl.is_none() && policy.is_hot(entry.hit_count) {
                    let ttl = policy.ttl_for(key, entry.hit_count, None);
                    entry.expire_after(now, ttl);
                }
                let value = entry.value.clone();
                Counters::bump(&self.counters.hits);
                Counters::bump(&self.counters.memory_hits);
                return Ok(Some(value));
            }

            if let Some(expired) = inner.memory.remove(key) {
                inner.unindex(key, &expired.tags);
            }
        }

        match self.disk.read(key) {
            Ok(Some(mut entry)) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                if entry.explicit_ttl.is_none() && policy.is_hot(entry.hit_count) {
                    let ttl = policy.ttl_for(key, entry.hit_count, None);
                    entry.expire_after(now, ttl);
                }
                let value = entry.value.clone();
                Counters::bump(&self.counters.hits);
                Counters::bump(&self.counters.disk_hits);

                if inner.memory.fits(entry.size_bytes) {
                    inner.index(&entry);
                    let evicted = inner.memory.insert(entry);
                    Counters::bump(&self.counters.promotions);
                    self.handle_evicted(&mut inner, evicted);
                }
                return Ok(Some(value));
            }
            Ok(Some(expired)) => {
                self.disk.remove(key)?;
                inner.unindex(key, &expired.tags);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Dropping unreadable cache entry");
                self.disk.remove(key)?;
            }
        }

        Counters::bump(&self.counters.misses);
        Ok(None)
    }

    /// Typed [`get`](Self::get)
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Store `value` under `key`
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> CacheResult<()> {
        let value = serde_json::to_value(value)?;
        let size_bytes = serde_json::to_vec(&value)?.len();
        let now = Utc::now();
        let mut inner = self.lock()?;

        // a refreshed value keeps the hits its key has already earned
        let hit_count = match inner.memory.peek(key) {
            Some(previous) => previous.hit_count,
            None => self
                .disk
                .read(key)
                .ok()
                .flatten()
                .map(|previous| previous.hit_count)
                .unwrap_or(0),
        };

        let mut entry = CacheEntry {
            key: key.to_string(),
            value,
            tags: options.tags,
            priority: options.priority,
            explicit_ttl: options.ttl,
            created_at: now,
            expires_at: now,
            hit_count,
            size_bytes,
        };
        entry.expire_after(now, self.config.ttl.ttl_for(key, hit_count, options.ttl));

        // the previous version may only live on disk, so drop the key from every tag
        inner.memory.remove(key);
        let all_tags: Vec<String> = inner.tags.keys().cloned().collect();
        inner.unindex(key, &all_tags);
        inner.index(&entry);

        let fits = inner.memory.fits(size_bytes);
        if entry.priority == CachePriority::High || options.persist_to_disk || !fits {
            self.disk.write(&entry)?;
        } else {
            // a stale disk copy would resurface after eviction
            self.disk.remove(key)?;
        }

        if fits {
            let evicted = inner.memory.insert(entry);
            self.handle_evicted(&mut inner, evicted);
        }
        Ok(())
    }

    fn handle_evicted(&self, inner: &mut Inner, evicted: Vec<CacheEntry>) {
        for victim in evicted {
            Counters::bump(&self.counters.evictions);

            if victim.hit_count > self.config.demote_threshold {
                match self.disk.write(&victim) {
                    Ok(()) => {
                        Counters::bump(&self.counters.demotions);
                        tracing::trace!(key = %victim.key, hits = victim.hit_count, "Demoted to disk");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(key = %victim.key, error = %e, "Failed to demote cache entry");
                    }
                }
            }

            // still indexed if an older copy is on disk
            if !self.disk.path_for(&victim.key).exists() {
                inner.unindex(&victim.key, &victim.tags);
            }
        }
    }

    /// Remove every entry carrying any of `tags` from both tiers
    pub fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> CacheResult<usize> {
        let mut inner = self.lock()?;

        let keys: HashSet<String> = tags
            .iter()
            .filter_map(|t| inner.tags.get(t.as_ref()))
            .flat_map(|keys| keys.iter().cloned())
            .collect();

        let mut removed = 0;
        for key in &keys {
            let in_memory = inner.memory.remove(key);
            let on_disk = self.disk.remove(key)?;
            if in_memory.is_some() || on_disk {
                removed += 1;
            }

            let all_tags: Vec<String> = inner.tags.keys().cloned().collect();
            inner.unindex(key, &all_tags);
        }

        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        tracing::debug!(
            tags = ?tags.iter().map(|t| t.as_ref()).collect::<Vec<_>>(),
            removed,
            "Cache invalidated by tags"
        );
        Ok(removed)
    }

    /// Remove one key from both tiers
    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut inner = self.lock()?;
        let in_memory = inner.memory.remove(key);
        if let Some(entry) = &in_memory {
            inner.unindex(key, &entry.tags);
        }
        let on_disk = self.disk.remove(key)?;
        Ok(in_memory.is_some() || on_disk)
    }

    /// Drop everything
    pub fn clear(&self) -> CacheResult<()> {
        let mut inner = self.lock()?;
        inner.memory.clear();
        inner.tags.clear();
        self.disk.clear()?;
        Ok(())
    }

    /// Time left before `key` expires
    pub fn remaining_ttl(&self, key: &str) -> CacheResult<Option<Duration>> {
        let now = Utc::now();
        {
            let inner = self.lock()?;
            if let Some(entry) = inner.memory.peek(key) {
                return Ok((!entry.is_expired(now)).then(|| entry.remaining(now)));
            }
        }
        Ok(self
            .disk
            .read(key)
            .ok()
            .flatten()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.remaining(now)))
    }

    pub fn stats(&self) -> CacheStats {
        let (memory_entries, memory_bytes) = self
            .lock()
            .map(|inner| (inner.memory.len(), inner.memory.bytes()))
            .unwrap_or_default();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        CacheStats {
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            memory_hits: load(&self.counters.memory_hits),
            disk_hits: load(&self.counters.disk_hits),
            evictions: load(&self.counters.evictions),
            demotions: load(&self.counters.demotions),
            promotions: load(&self.counters.promotions),
            invalidations: load(&self.counters.invalidations),
            memory_entries,
            memory_bytes,
        }
    }

    /// Purge expired entries from memory and expired/unreadable files from disk
    pub fn sweep(&self) -> CacheResult<SweepReport> {
        let now = Utc::now();
        let mut inner = self.lock()?;

        let expired = inner.memory.purge_expired(now);
        for entry in &expired {
            inner.unindex(&entry.key, &entry.tags);
        }

        let mut report = self.disk.sweep(now)?;
        report.memory_expired = expired.len();

        // disk files may have carried tags for keys no longer anywhere
        let stale: Vec<String> = inner
            .tags
            .values()
            .flat_map(|keys| keys.iter().cloned())
            .filter(|k| inner.memory.peek(k).is_none() && !self.disk.path_for(k).exists())
            .collect();
        let all_tags: Vec<String> = inner.tags.keys().cloned().collect();
        for key in stale {
            inner.unindex(&key, &all_tags);
        }

        Ok(report)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the task is aborted
    pub fn start_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let cache = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || cache.sweep()).await {
                    Ok(Ok(report)) => tracing::debug!(
                        expired = report.expired,
                        corrupt = report.corrupt,
                        memory_expired = report.memory_expired,
                        "Cache sweep finished"
                    ),
                    Ok(Err(e)) => tracing::warn!(error = %e, "Cache sweep failed"),
                    Err(e) => tracing::error!(error = %e, "Cache sweep task panicked"),
                }
            }
        })
    }
}

impl InvalidationSink for IntelligentCache {
    fn invalidate_tags(&self, tags: &[String]) -> usize {
        match self.invalidate_by_tags(tags) {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(tags = ?tags, error = %e, "Cache invalidation failed");
                0
            }
        }
    }
}
