//! Adaptive TTL selection
//!
//! Precedence: explicit TTL, then hot-entry extension, then the key's
//! namespace default.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Freshness class derived from the key prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// `realtime:` / `live:`
    Realtime,
    /// `agg:` / `aggregate:`
    Aggregate,
    /// `history:` / `historical:`
    Historical,
    Other,
}

impl Namespace {
    pub fn of(key: &str) -> Self {
        let prefix = key.split(':').next().unwrap_or_default();
        match prefix {
            "realtime" | "live" => Namespace::Realtime,
            "agg" | "aggregate" => Namespace::Aggregate,
            "history" | "historical" => Namespace::Historical,
            _ => Namespace::Other,
        }
    }
}

/// TTL defaults (seconds in config files)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlPolicy {
    #[serde(default = "default_realtime_secs")]
    pub realtime_secs: u64,
    #[serde(default = "default_aggregate_secs")]
    pub aggregate_secs: u64,
    #[serde(default = "default_historical_secs")]
    pub historical_secs: u64,
    /// Hit count above which an entry counts as hot
    #[serde(default = "default_hot_threshold")]
    pub hot_threshold: u64,
    /// Multiplier applied to a hot entry's namespace TTL
    #[serde(default = "default_hot_ttl_factor")]
    pub hot_ttl_factor: u32,
}

fn default_realtime_secs() -> u64 {
    30
}

fn default_aggregate_secs() -> u64 {
    300
}

fn default_historical_secs() -> u64 {
    3600
}

fn default_hot_threshold() -> u64 {
    10
}

fn default_hot_ttl_factor() -> u32 {
    4
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            realtime_secs: default_realtime_secs(),
            aggregate_secs: default_aggregate_secs(),
            historical_secs: default_historical_secs(),
            hot_threshold: default_hot_threshold(),
            hot_ttl_factor: default_hot_ttl_factor(),
        }
    }
}

impl TtlPolicy {
    /// Namespace default, unknown prefixes get the medium TTL
    pub fn namespace_ttl(&self, key: &str) -> Duration {
        let secs = match Namespace::of(key) {
            Namespace::Realtime => self.realtime_secs,
            Namespace::Aggregate | Namespace::Other => self.aggregate_secs,
            Namespace::Historical => self.historical_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn is_hot(&self, hit_count: u64) -> bool {
        hit_count > self.hot_threshold
    }

    /// TTL for an entry with `hit_count` hits
    pub fn ttl_for(&self, key: &str, hit_count: u64, explicit: Option<Duration>) -> Duration {
        if let Some(ttl) = explicit {
            return ttl;
        }
        let base = self.namespace_ttl(key);
        if self.is_hot(hit_count) {
            base.saturating_mul(self.hot_ttl_factor.max(1))
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_from_prefix() {
        assert_eq!(Namespace::of("realtime:latest:ort"), Namespace::Realtime);
        assert_eq!(Namespace::of("live:ort"), Namespace::Realtime);
        assert_eq!(Namespace::of("agg:hourly:ort"), Namespace::Aggregate);
        assert_eq!(Namespace::of("historical:2023"), Namespace::Historical);
        assert_eq!(Namespace::of("k1"), Namespace::Other);
    }

    #[test]
    fn test_ttl_precedence() {
        let policy = TtlPolicy::default();
        assert_eq!(policy.ttl_for("realtime:x", 0, None), Duration::from_secs(30));
        assert_eq!(policy.ttl_for("history:x", 0, None), Duration::from_secs(3600));
        assert_eq!(policy.ttl_for("other", 0, None), Duration::from_secs(300));

        // Exactly at the threshold is not yet hot
        assert_eq!(policy.ttl_for("realtime:x", 10, None), Duration::from_secs(30));
        assert_eq!(policy.ttl_for("realtime:x", 11, None), Duration::from_secs(120));

        let explicit = Some(Duration::from_millis(1000));
        assert_eq!(policy.ttl_for("realtime:x", 50, explicit), Duration::from_millis(1000));
    }
}
