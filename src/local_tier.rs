//! Local Tier (L1) - bounded process-local cache
//!
//! Entries live for a short fixed local TTL regardless of their remote TTL,
//! which bounds L1 staleness even when invalidation notifications are lost.
//! When full, the oldest-inserted entry is evicted; overwriting a key moves
//! it to the back of the eviction queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::LocalTierConfig;
use crate::pattern::KeyPattern;

/// Cache entry with its local expiry
#[derive(Debug, Clone)]
struct LocalEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Bounded insertion-ordered map with per-entry expiry.
pub struct LocalTier {
    entries: Mutex<IndexMap<String, LocalEntry>>,
    capacity: usize,
    ttl: Duration,
    evictions: AtomicU64,
}

impl LocalTier {
    #[must_use]
    pub fn new(config: LocalTierConfig) -> Self {
        debug!(capacity = config.capacity, ttl_ms = config.ttl_ms, "Initializing local cache tier");
        Self {
            entries: Mutex::new(IndexMap::with_capacity(config.capacity.min(4096))),
            capacity: config.capacity,
            ttl: config.ttl(),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a live entry; an expired entry is removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired(Instant::now()) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.shift_remove(key);
        }
        None
    }

    /// Insert under the local TTL, evicting the oldest entries if full.
    pub fn insert(&self, key: &str, value: serde_json::Value) {
        self.insert_capped(key, value, self.ttl);
    }

    /// Insert for the local TTL or `max_ttl`, whichever is shorter.
    pub fn insert_capped(&self, key: &str, value: serde_json::Value, max_ttl: Duration) {
        if self.capacity == 0 {
            return;
        }
        let entry = LocalEntry {
            value,
            expires_at: Instant::now() + self.ttl.min(max_ttl),
        };

        let mut entries = self.entries.lock();
        entries.shift_remove(key);
        while entries.len() >= self.capacity {
            if entries.shift_remove_index(0).is_none() {
                break;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.insert(key.to_string(), entry);
    }

    /// Remove one key. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().shift_remove(key).is_some()
    }

    /// Remove every key matched by `pattern`, returning how many were removed.
    pub fn remove_matching(&self, pattern: &KeyPattern) -> usize {
        if let KeyPattern::Exact(key) = pattern {
            return usize::from(self.remove(key));
        }
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !pattern.matches(key));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of entries currently held (expired entries included until touched).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries evicted for capacity since creation.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tier(capacity: usize) -> LocalTier {
        LocalTier::new(LocalTierConfig {
            capacity,
            ttl_ms: 60_000,
        })
    }

    #[test]
    fn test_evicts_oldest_inserted_key() {
        let l1 = tier(3);
        for i in 0..4 {
            l1.insert(&format!("k{i}"), json!(i));
        }
        assert_eq!(l1.len(), 3);
        assert_eq!(l1.get("k0"), None);
        assert_eq!(l1.get("k1"), Some(json!(1)));
        assert_eq!(l1.get("k3"), Some(json!(3)));
        assert_eq!(l1.evictions(), 1);
    }

    #[test]
    fn test_overwrite_refreshes_position() {
        let l1 = tier(2);
        l1.insert("a", json!(1));
        l1.insert("b", json!(2));
        l1.insert("a", json!(3));
        l1.insert("c", json!(4));
        assert_eq!(l1.get("b"), None);
        assert_eq!(l1.get("a"), Some(json!(3)));
        assert_eq!(l1.len(), 2);
    }

    #[test]
    fn test_zero_capacity_disables_tier() {
        let l1 = tier(0);
        l1.insert("a", json!(1));
        assert!(l1.is_empty());
        assert_eq!(l1.get("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_dropped_on_read() {
        let l1 = LocalTier::new(LocalTierConfig {
            capacity: 10,
            ttl_ms: 1_000,
        });
        l1.insert("a", json!("v"));
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(l1.get("a"), Some(json!("v")));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(l1.get("a"), None);
        assert!(l1.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capped_insert_never_outlives_caller_ttl() {
        let l1 = tier(10);
        l1.insert_capped("short", json!(1), Duration::from_secs(5));
        l1.insert_capped("long", json!(2), Duration::from_secs(3_600));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(l1.get("short"), None);
        assert_eq!(l1.get("long"), Some(json!(2)));
        tokio::time::advance(Duration::from_secs(55)).await;
        assert_eq!(l1.get("long"), None);
    }

    #[test]
    fn test_remove_matching_pattern() {
        let l1 = tier(10);
        l1.insert("place:list:a", json!(1));
        l1.insert("place:list:b", json!(2));
        l1.insert("place:detail:5", json!(3));

        let removed = l1.remove_matching(&KeyPattern::parse("place:list:*").unwrap());
        assert_eq!(removed, 2);
        assert_eq!(l1.get("place:detail:5"), Some(json!(3)));
        assert_eq!(l1.remove_matching(&KeyPattern::exact("place:detail:5")), 1);
        assert!(l1.is_empty());
    }
}
