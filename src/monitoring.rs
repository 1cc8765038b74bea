//! Monitoring
//!
//! Read-only views of cache health: the remote store's own keyspace
//! counters, the hit ratio derived from them, and this process's service
//! counters.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache_service::{CacheService, ServiceStats};

/// A single value from an INFO section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InfoValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl InfoValue {
    fn parse(raw: &str) -> Self {
        if let Ok(n) = raw.parse() {
            Self::Integer(n)
        } else if let Ok(f) = raw.parse() {
            Self::Float(f)
        } else {
            Self::Text(raw.to_string())
        }
    }

    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Integer(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }
}

/// Parse `name:value` lines, skipping blank lines and `#` section headers.
#[must_use]
pub fn parse_info(raw: &str) -> BTreeMap<String, InfoValue> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.to_string(), InfoValue::parse(value)))
        .collect()
}

/// Remote store statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub connected: bool,
    pub stats: BTreeMap<String, InfoValue>,
    pub memory: BTreeMap<String, InfoValue>,
}

/// Keyspace hit ratio of the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HitRate {
    pub hits: u64,
    pub misses: u64,
    pub total: u64,
    /// Percentage of lookups that hit; `None` before any lookup.
    pub rate: Option<f64>,
}

impl HitRate {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(hits: u64, misses: u64) -> Self {
        let total = hits.saturating_add(misses);
        let rate = (total > 0).then(|| hits as f64 / total as f64 * 100.0);
        Self {
            hits,
            misses,
            total,
            rate,
        }
    }
}

impl fmt::Display for HitRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rate {
            Some(rate) => write!(f, "{rate:.2}%"),
            None => f.write_str("N/A"),
        }
    }
}

pub struct CacheMonitor {
    cache: Arc<CacheService>,
}

impl CacheMonitor {
    #[must_use]
    pub fn new(cache: Arc<CacheService>) -> Self {
        Self { cache }
    }

    /// Connectivity plus the store's `stats` and `memory` INFO sections.
    ///
    /// Never fails: an unreachable store reports `connected: false`.
    pub async fn cache_stats(&self) -> StoreStats {
        let remote = self.cache.remote();
        if !remote.ping().await {
            return StoreStats::default();
        }

        let section = |name: &'static str, raw: Result<String>| match raw {
            Ok(raw) => parse_info(&raw),
            Err(e) => {
                warn!(section = name, error = %e, "Failed to read store INFO section");
                BTreeMap::new()
            }
        };
        StoreStats {
            connected: true,
            stats: section("stats", remote.info("stats").await),
            memory: section("memory", remote.info("memory").await),
        }
    }

    /// Hit ratio from the store's `keyspace_hits` / `keyspace_misses`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store's statistics cannot be read.
    pub async fn cache_hit_rate(&self) -> Result<HitRate> {
        let stats = parse_info(&self.cache.remote().info("stats").await?);
        let counter = |name: &str| stats.get(name).and_then(InfoValue::as_u64).unwrap_or(0);
        Ok(HitRate::new(counter("keyspace_hits"), counter("keyspace_misses")))
    }

    /// This process's counters.
    #[must_use]
    pub fn service_stats(&self) -> ServiceStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info_sections() {
        let raw = "# Stats\r\nkeyspace_hits:120\r\nkeyspace_misses:30\r\n\r\n# Memory\r\nused_memory_human:1.5M\r\nmem_fragmentation_ratio:1.25\r\n";
        let parsed = parse_info(raw);
        assert_eq!(parsed.get("keyspace_hits"), Some(&InfoValue::Integer(120)));
        assert_eq!(parsed.get("mem_fragmentation_ratio"), Some(&InfoValue::Float(1.25)));
        assert_eq!(parsed.get("used_memory_human"), Some(&InfoValue::Text("1.5M".into())));
        assert_eq!(parsed.len(), 4);
    }

    #[test]
    fn test_value_may_contain_colons() {
        let parsed = parse_info("executable:/usr/bin/redis-server\r\nlisten:tcp:6379");
        assert_eq!(parsed.get("listen"), Some(&InfoValue::Text("tcp:6379".into())));
    }

    #[test]
    fn test_hit_rate_display() {
        assert_eq!(HitRate::new(120, 30).to_string(), "80.00%");
        assert_eq!(HitRate::new(1, 2).to_string(), "33.33%");
        let empty = HitRate::new(0, 0);
        assert_eq!(empty.rate, None);
        assert_eq!(empty.to_string(), "N/A");
    }
}
