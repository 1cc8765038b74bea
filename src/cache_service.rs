//! Cache Service - Unified Cache Operations
//!
//! Combines the process-local tier (L1) with the shared remote tier (L2)
//! behind get/set/delete, pattern deletes, cache-aside and a
//! stampede-protected cache-aside.
//!
//! Remote store failures never reach the caller of an ordinary read or
//! write: reads degrade to a miss, writes degrade to L1-only, and the failure
//! is logged and counted in [`ServiceStats::store_errors`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{CacheConfig, LockConfig};
use crate::error::CacheError;
use crate::keys;
use crate::local_tier::LocalTier;
use crate::pattern::KeyPattern;
use crate::traits::RemoteStore;

/// Ownership of one stampede lock token.
///
/// Released explicitly by the holder; if the holder panics or its future is
/// dropped first, `Drop` spawns the release instead.
struct LockGuard {
    store: Arc<dyn RemoteStore>,
    lock_key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    async fn release(mut self) {
        match self.store.delete_if_equals(&self.lock_key, &self.token).await {
            Ok(true) => debug!(lock_key = %self.lock_key, "Released cache lock"),
            Ok(false) => debug!(lock_key = %self.lock_key, "Cache lock expired before release"),
            Err(e) => warn!(lock_key = %self.lock_key, error = %e, "Failed to release cache lock; it will expire"),
        }
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let lock_key = std::mem::take(&mut self.lock_key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.delete_if_equals(&lock_key, &token).await {
                warn!(lock_key = %lock_key, error = %e, "Failed to release abandoned cache lock");
            }
        });
    }
}

/// Snapshot of this process's cache counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceStats {
    pub total_requests: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    /// Percentage of requests served from either tier.
    pub hit_rate: f64,
    pub store_errors: u64,
    pub corrupt_entries: u64,
    pub lock_waits: u64,
    pub lock_timeouts: u64,
    pub l1_entries: usize,
    pub l1_evictions: u64,
}

/// Cache Service - unified operations across L1 and L2
pub struct CacheService {
    local: LocalTier,
    remote: Arc<dyn RemoteStore>,
    lock: LockConfig,
    total_requests: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    store_errors: AtomicU64,
    corrupt_entries: AtomicU64,
    lock_waits: AtomicU64,
    lock_timeouts: AtomicU64,
}

impl CacheService {
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteStore>, config: &CacheConfig) -> Self {
        debug!(backend = remote.name(), "Initializing cache service");
        Self {
            local: LocalTier::new(config.local),
            remote,
            lock: config.lock,
            total_requests: AtomicU64::new(0),
            l1_hits: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            corrupt_entries: AtomicU64::new(0),
            lock_waits: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
        }
    }

    /// The shared tier this service writes through to.
    #[must_use]
    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    fn record_store_error(&self, operation: &'static str, key: &str, error: &anyhow::Error) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        warn!(
            operation = operation,
            key = %key,
            backend = self.remote.name(),
            error = %error,
            "Remote cache store failed; degrading"
        );
    }

    /// Look a key up in L1, then L2, promoting L2 hits into L1.
    async fn lookup(&self, key: &str) -> Option<serde_json::Value> {
        if let Some(value) = self.local.get(key) {
            self.l1_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "[L1] Cache hit");
            return Some(value);
        }

        match self.remote.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(value) => {
                    self.l2_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "[L2] Cache hit, promoting to L1");
                    self.local.insert(key, value.clone());
                    Some(value)
                }
                Err(e) => {
                    self.corrupt_entries.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Corrupt cache entry treated as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.record_store_error("get", key, &e);
                None
            }
        }
    }

    async fn get_inner<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.lookup(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                self.corrupt_entries.fetch_add(1, Ordering::Relaxed);
                self.local.remove(key);
                warn!(key = %key, error = %e, "Cached value has unexpected shape; treated as miss");
                None
            }
        }
    }

    /// Get a value, L1 first, then the remote tier.
    ///
    /// Absence is a normal result: a miss, an unreadable entry and an
    /// unreachable store all return `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let found = self.get_inner(key).await;
        if found.is_none() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache miss");
        }
        found
    }

    /// Store a value in both tiers; the remote copy lives for `ttl`, the
    /// local copy for the fixed local TTL capped at `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialization`] if `value` cannot be serialized.
    /// Store failures are not errors: the value is kept in L1 only.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let value = serde_json::to_value(value).map_err(CacheError::Serialization)?;
        let bytes = serde_json::to_vec(&value).map_err(CacheError::Serialization)?;

        match self.remote.set_with_ttl(key, &bytes, ttl).await {
            Ok(()) => debug!(key = %key, ttl_secs = %ttl.as_secs(), "[L1+L2] Cached value"),
            Err(e) => self.record_store_error("set", key, &e),
        }
        self.local.insert_capped(key, value, ttl);
        Ok(())
    }

    /// Remove a key from both tiers. Deleting an absent key is a no-op.
    ///
    /// The local copy is dropped after the remote delete, so a read racing
    /// the delete cannot leave the old value behind in L1.
    pub async fn delete(&self, key: &str) {
        if let Err(e) = self.remote.delete(&[key.to_string()]).await {
            self.record_store_error("delete", key, &e);
        }
        self.local.remove(key);
    }

    /// Delete every key matching `pattern` from both tiers.
    ///
    /// Best-effort: a key written by another process between the remote scan
    /// and the batch delete may survive until its TTL. L1 is swept after the
    /// remote delete, so a read racing the invalidation cannot re-promote the
    /// old value. Returns how many remote keys were deleted.
    pub async fn delete_by_pattern(&self, pattern: &KeyPattern) -> usize {
        let deleted = self.delete_remote_matching(pattern).await;
        let evicted = self.local.remove_matching(pattern);
        debug!(pattern = %pattern, deleted = deleted, local_evicted = evicted, "Invalidated keys by pattern");
        deleted
    }

    async fn delete_remote_matching(&self, pattern: &KeyPattern) -> usize {
        let keys = match self.remote.keys_matching(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                self.record_store_error("keys_matching", &pattern.to_string(), &e);
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }

        match self.remote.delete(&keys).await {
            Ok(deleted) => deleted,
            Err(e) => {
                self.record_store_error("delete", &pattern.to_string(), &e);
                0
            }
        }
    }

    /// Drop locally held keys matching any of `patterns`, leaving the remote tier alone.
    ///
    /// Applied when a sibling process announces an invalidation.
    pub fn evict_local(&self, patterns: &[KeyPattern]) -> usize {
        patterns.iter().map(|p| self.local.remove_matching(p)).sum()
    }

    pub fn clear_local(&self) {
        self.local.clear();
    }

    async fn store_fetched<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_value(value) {
            Ok(serde_json::Value::Null) => {
                debug!(key = %key, "Fetched value is null; not caching");
            }
            Ok(_) => {
                if let Err(e) = self.set(key, value, ttl).await {
                    warn!(key = %key, error = %e, "Failed to cache fetched value");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Fetched value is not serializable; not caching"),
        }
    }

    /// Cache-aside: return the cached value, or run `fetch` and cache its result.
    ///
    /// A `None`/null result is returned but not cached.
    ///
    /// # Errors
    ///
    /// Returns the error from `fetch` unchanged; nothing is cached in that case.
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, fetch: F, ttl: Duration) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        debug!(key = %key, "Fetching fresh value");
        let value = fetch().await?;
        self.store_fetched(key, &value, ttl).await;
        Ok(value)
    }

    /// Cache-aside with at most one `fetch` in flight per key across every
    /// process sharing the remote store.
    ///
    /// On a miss the caller tries to create the `lock:{key}` token. The
    /// winner re-checks the cache, runs `fetch`, stores the result and
    /// releases the token. Losers wait and start over, so they usually see
    /// the winner's value. If the holder dies, its token expires after
    /// `lock_ttl` and a waiter takes over. Waiting is bounded by the lock
    /// retry settings and never shorter than one `lock_ttl`.
    ///
    /// When the store cannot be reached to take the lock the call falls back
    /// to an unprotected fetch.
    ///
    /// # Errors
    ///
    /// - the error from `fetch`, unchanged
    /// - [`CacheError::LockTimeout`] when the wait bound is exhausted
    pub async fn get_or_set_with_lock<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        ttl: Duration,
        lock_ttl: Duration,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let lock_key = keys::lock_key(key);
        let max_attempts = self.lock.max_attempts(lock_ttl);

        // One lookup, however many attempts it takes.
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        for attempt in 1..=max_attempts {
            if let Some(value) = self.get_inner(key).await {
                return Ok(value);
            }

            let token = Uuid::new_v4().to_string();
            match self.remote.create_if_absent(&lock_key, &token, lock_ttl).await {
                Ok(true) => {
                    let guard = LockGuard {
                        store: Arc::clone(&self.remote),
                        lock_key,
                        token,
                        released: false,
                    };
                    debug!(key = %key, attempt = attempt, "Acquired cache lock");

                    // A previous holder may have filled the cache after our miss.
                    if let Some(value) = self.get_inner(key).await {
                        guard.release().await;
                        return Ok(value);
                    }

                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let result = fetch().await;
                    if let Ok(value) = &result {
                        self.store_fetched(key, value, ttl).await;
                    }
                    guard.release().await;
                    return result;
                }
                Ok(false) => {
                    self.lock_waits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, attempt = attempt, "Cache lock held elsewhere; waiting");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.lock.backoff()).await;
                    }
                }
                Err(e) => {
                    self.record_store_error("create_if_absent", &lock_key, &e);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let value = fetch().await?;
                    self.store_fetched(key, &value, ttl).await;
                    return Ok(value);
                }
            }
        }

        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        warn!(key = %key, attempts = max_attempts, "Gave up waiting for cache lock");
        Err(CacheError::LockTimeout {
            key: key.to_string(),
            attempts: max_attempts,
        }
        .into())
    }

    /// Atomically increment a counter, applying `ttl` only when this call created it.
    ///
    /// Later increments never extend the counter's expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot perform the increment.
    pub async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        let count = self.remote.increment(key).await?;
        if count == 1 {
            match self.remote.expire(key, ttl).await {
                Ok(true) => {}
                Ok(false) => warn!(key = %key, "Counter vanished before its TTL could be set"),
                Err(e) => warn!(key = %key, error = %e, "Failed to set counter TTL"),
            }
        }
        Ok(count)
    }

    /// Add members to a remote set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn set_add(&self, key: &str, members: &[String]) -> Result<usize> {
        self.remote.set_add(key, members).await
    }

    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.remote.set_members(key).await
    }

    /// Store one JSON-encoded field of a remote hash.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized or the store operation fails.
    pub async fn hash_set<T: Serialize + ?Sized>(&self, key: &str, field: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(CacheError::Serialization)?;
        self.remote.hash_set(key, field, &bytes).await
    }

    /// Read one field of a remote hash; an unreadable field reads as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn hash_get<T: DeserializeOwned>(&self, key: &str, field: &str) -> Result<Option<T>> {
        let Some(bytes) = self.remote.hash_get(key, field).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.corrupt_entries.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, field = %field, error = %e, "Corrupt hash field treated as absent");
                Ok(None)
            }
        }
    }

    /// Read every field of a remote hash, skipping unreadable fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn hash_get_all<T: DeserializeOwned>(&self, key: &str) -> Result<HashMap<String, T>> {
        let raw = self.remote.hash_get_all(key).await?;
        let mut fields = HashMap::with_capacity(raw.len());
        for (field, bytes) in raw {
            match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    fields.insert(field, value);
                }
                Err(e) => {
                    self.corrupt_entries.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, field = %field, error = %e, "Skipping corrupt hash field");
                }
            }
        }
        Ok(fields)
    }

    /// Get cache statistics
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> ServiceStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let l1_hits = self.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.l2_hits.load(Ordering::Relaxed);
        let hit_rate = if total_requests > 0 {
            ((l1_hits + l2_hits) as f64 / total_requests as f64) * 100.0
        } else {
            0.0
        };

        ServiceStats {
            total_requests,
            l1_hits,
            l2_hits,
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate,
            store_errors: self.store_errors.load(Ordering::Relaxed),
            corrupt_entries: self.corrupt_entries.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            l1_entries: self.local.len(),
            l1_evictions: self.local.evictions(),
        }
    }
}
