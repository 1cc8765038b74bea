//! Store Capability Traits
//!
//! The cache layer talks to the shared remote tier and to the notification
//! bus only through these traits, so the Redis backend can be swapped for
//! the in-process [`InMemoryStore`](crate::backends::InMemoryStore) (single
//! process deployments, tests) or any other implementation.
//!
//! # Architecture
//!
//! - `RemoteStore`: shared key-value tier with per-key expiry, counters,
//!   ranked sets, geo indexes, sets and hashes
//! - `Publisher`: fire-and-forget channel publication for invalidation events
//!
//! # Example: Custom Publisher
//!
//! ```rust,ignore
//! use place_cache::{Publisher, async_trait};
//! use anyhow::Result;
//!
//! struct KafkaPublisher { /* ... */ }
//!
//! #[async_trait]
//! impl Publisher for KafkaPublisher {
//!     async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
//!         // Your implementation
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::pattern::KeyPattern;

/// A member of a geospatial index.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoMember {
    pub member: String,
    pub longitude: f64,
    pub latitude: f64,
}

/// Shared remote cache tier (L2).
///
/// Every operation is single-key or a small idempotent batch; no operation
/// requires a multi-key transaction. TTLs are rounded up to whole seconds by
/// implementations that only support second precision.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the cache service shares one
/// instance across all tasks.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get raw bytes stored under `key`.
    ///
    /// * `Ok(None)` - key absent or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store bytes under `key`, replacing any previous value and expiry.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete keys in one batch, returning how many existed.
    ///
    /// Deleting absent keys is not an error.
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    /// List keys currently matching `pattern`.
    ///
    /// The listing is a point-in-time scan: keys written concurrently may or
    /// may not be included.
    async fn keys_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>>;

    /// Atomically create `key` holding `value` with an expiry, only if absent.
    ///
    /// Returns `true` when this call created the key.
    async fn create_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it currently holds `value`.
    ///
    /// Returns `true` when the key was deleted.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;

    /// Atomically increment the integer at `key` (created as 0 if absent).
    ///
    /// Returns the post-increment value. Does not touch the key's expiry.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Set the expiry of an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remaining time to live of `key`.
    ///
    /// * `Ok(None)` - key absent or has no expiry
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Replace the whole ranked set at `key` and apply `ttl` to the set.
    async fn sorted_set_replace(&self, key: &str, members: &[(String, f64)], ttl: Duration) -> Result<()>;

    /// Read `count` members starting at `offset`, highest score first, with scores.
    async fn sorted_set_top_n(&self, key: &str, offset: usize, count: usize) -> Result<Vec<(String, f64)>>;

    /// Replace the whole geo index at `key` and apply `ttl` to the index.
    async fn geo_replace(&self, key: &str, members: &[GeoMember], ttl: Duration) -> Result<()>;

    /// Members within `radius_km` of a point, nearest first, with distances in km.
    async fn geo_radius(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        radius_km: f64,
    ) -> Result<Vec<(String, f64)>>;

    /// Add members to the set at `key`, returning how many were new.
    async fn set_add(&self, key: &str, members: &[String]) -> Result<usize>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> Result<()>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>>;

    /// Textual metrics for one INFO-style section (`stats`, `memory`).
    ///
    /// Lines are `name:value`, sections start with `#`.
    async fn info(&self, section: &str) -> Result<String>;

    /// Check that the store is reachable.
    async fn ping(&self) -> bool;

    /// Name of this backend for logging.
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Publication side of the invalidation notification bus.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` to every subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
}

/// Publisher for single-process deployments with no sibling caches.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish(&self, channel: &str, _payload: &str) -> Result<()> {
        tracing::debug!(channel = %channel, "No publisher configured; dropping invalidation event");
        Ok(())
    }
}
