//! Cache entry and write options

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Write priority; `High` entries are also written to disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Options for [`IntelligentCache::set`](super::IntelligentCache::set)
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub priority: CachePriority,
    pub persist_to_disk: bool,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: explicit TTL
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Builder method: add a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Builder method: add tags
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Builder method: set priority
    pub fn priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method: also write to the disk tier
    pub fn persist(mut self) -> Self {
        self.persist_to_disk = true;
        self
    }
}

/// A cached value with its bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub tags: Vec<String>,
    pub priority: CachePriority,
    /// TTL requested by the caller, if any
    pub explicit_ttl: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    /// Serialized JSON size
    pub size_bytes: usize,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time until expiry, zero once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Restart the expiry clock at `now`
    pub fn expire_after(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.expires_at = now
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
    }
}
