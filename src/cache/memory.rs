//! Bounded in-memory tier
//!
//! Recency is a monotonically increasing tick per access; the `lru` map
//! orders keys by their last tick so the victim is always its first entry.

use crate::cache::entry::CacheEntry;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

pub struct MemoryTier {
    slots: HashMap<String, Slot>,
    lru: BTreeMap<u64, String>,
    next_tick: u64,
    bytes: usize,
    max_items: usize,
    max_bytes: usize,
}

impl MemoryTier {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            slots: HashMap::new(),
            lru: BTreeMap::new(),
            next_tick: 0,
            bytes: 0,
            max_items: max_items.max(1),
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Whether an entry of `size` bytes can be held at all
    pub fn fits(&self, size: usize) -> bool {
        size <= self.max_bytes
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// Look up and mark as most recently used
    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        let tick = self.tick();
        let slot = self.slots.get_mut(key)?;
        self.lru.remove(&slot.tick);
        slot.tick = tick;
        self.lru.insert(tick, key.to_string());
        Some(&mut slot.entry)
    }

    /// Look up without touching recency
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.slots.get(key).map(|s| &s.entry)
    }

    /// Insert or replace, returning entries evicted to stay within budget
    pub fn insert(&mut self, entry: CacheEntry) -> Vec<CacheEntry> {
        let key = entry.key.clone();
        self.remove(&key);

        let tick = self.tick();
        self.bytes += entry.size_bytes;
        self.lru.insert(tick, key.clone());
        self.slots.insert(key.clone(), Slot { entry, tick });

        let mut evicted = Vec::new();
        while self.slots.len() > self.max_items || self.bytes > self.max_bytes {
            let victim = match self.lru.iter().next() {
                Some((_, k)) if *k != key => k.clone(),
                _ => break,
            };
            if let Some(entry) = self.remove(&victim) {
                evicted.push(entry);
            }
        }
        evicted
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.lru.remove(&slot.tick);
        self.bytes = self.bytes.saturating_sub(slot.entry.size_bytes);
        Some(slot.entry)
    }

    /// Drop expired entries
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let expired: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, s)| s.entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        expired.iter().filter_map(|k| self.remove(k)).collect()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.lru.clear();
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CachePriority;

    fn entry(key: &str, size: usize) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            key: key.to_string(),
            value: serde_json::json!(key),
            tags: vec![],
            priority: CachePriority::Normal,
            explicit_ttl: None,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            hit_count: 0,
            size_bytes: size,
        }
    }

    #[test]
    fn test_item_budget_evicts_least_recent() {
        let mut tier = MemoryTier::new(2, 1024);
        tier.insert(entry("a", 1));
        tier.insert(entry("b", 1));
        tier.get_mut("a");

        let evicted = tier.insert(entry("c", 1));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "b");
        assert!(tier.peek("a").is_some());
        assert!(tier.peek("c").is_some());
    }

    #[test]
    fn test_byte_budget() {
        let mut tier = MemoryTier::new(100, 10);
        tier.insert(entry("a", 4));
        tier.insert(entry("b", 4));
        let evicted = tier.insert(entry("c", 4));

        assert_eq!(evicted.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(tier.bytes(), 8);
        assert!(!tier.fits(11));
    }

    #[test]
    fn test_replace_keeps_byte_count() {
        let mut tier = MemoryTier::new(10, 100);
        tier.insert(entry("a", 10));
        tier.insert(entry("a", 20));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.bytes(), 20);

        tier.remove("a");
        assert!(tier.is_empty());
        assert_eq!(tier.bytes(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let mut tier = MemoryTier::new(10, 100);
        let mut stale = entry("old", 1);
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        tier.insert(stale);
        tier.insert(entry("new", 1));

        let purged = tier.purge_expired(Utc::now());
        assert_eq!(purged.len(), 1);
        assert_eq!(tier.len(), 1);
    }
}
