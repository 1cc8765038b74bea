//! Cache configuration
//!
//! All structs deserialize with defaults so they can be embedded in an
//! application's own config file; `CacheConfig::from_env` covers the common
//! deployment knobs.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Top-level configuration for a [`CacheSystem`](crate::CacheSystem).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis connection string for the shared tier.
    pub redis_url: String,
    /// Process-local tier settings.
    pub local: LocalTierConfig,
    /// Stampede lock retry settings.
    pub lock: LockConfig,
    /// Channel carrying invalidation events between processes.
    pub invalidation_channel: String,
    /// Cache warmer settings.
    pub warmup: WarmupConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            local: LocalTierConfig::default(),
            lock: LockConfig::default(),
            invalidation_channel: "cache:invalidate".to_string(),
            warmup: WarmupConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Defaults overridden by environment variables.
    ///
    /// - `REDIS_URL`
    /// - `PLACE_CACHE_L1_CAPACITY`
    /// - `PLACE_CACHE_L1_TTL_MS`
    /// - `PLACE_CACHE_LOCK_MAX_WAIT_MS`
    ///
    /// Unparseable numeric values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(capacity) = env_number("PLACE_CACHE_L1_CAPACITY") {
            config.local.capacity = capacity;
        }
        if let Some(ttl_ms) = env_number("PLACE_CACHE_L1_TTL_MS") {
            config.local.ttl_ms = ttl_ms;
        }
        if let Some(max_wait_ms) = env_number("PLACE_CACHE_LOCK_MAX_WAIT_MS") {
            config.lock.max_wait_ms = max_wait_ms;
        }
        config
    }

    /// Reject settings that would make the cache misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.lock.retry_interval_ms == 0 {
            return Err(CacheError::Config("lock.retry_interval_ms must be greater than 0".into()));
        }
        if self.lock.max_wait_ms < self.lock.retry_interval_ms {
            return Err(CacheError::Config(
                "lock.max_wait_ms must be at least lock.retry_interval_ms".into(),
            ));
        }
        if self.invalidation_channel.is_empty() {
            return Err(CacheError::Config("invalidation_channel must not be empty".into()));
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = %name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Process-local tier (L1) settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LocalTierConfig {
    /// Maximum number of entries; 0 disables the tier.
    pub capacity: usize,
    /// Fixed local TTL, independent of the remote TTL.
    pub ttl_ms: u64,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl_ms: 60_000,
        }
    }
}

impl LocalTierConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Retry policy for callers that lose the stampede lock.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Base delay between attempts.
    pub retry_interval_ms: u64,
    /// Random extra delay added to each wait, up to this many milliseconds.
    pub jitter_ms: u64,
    /// Upper bound on the total wait for one lookup.
    ///
    /// Always stretched to at least one lock TTL plus one retry so that a
    /// crashed holder's expired lock can be taken over.
    pub max_wait_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 100,
            jitter_ms: 20,
            max_wait_ms: 20_000,
        }
    }
}

impl LockConfig {
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }

    /// Number of lock attempts allowed for a lock with the given TTL.
    #[must_use]
    pub fn max_attempts(&self, lock_ttl: Duration) -> u32 {
        let retry = self.retry_interval();
        let floor = lock_ttl + retry;
        let wait = Duration::from_millis(self.max_wait_ms).max(floor);
        let waits = wait.as_millis().div_ceil(retry.as_millis());
        u32::try_from(waits).unwrap_or(u32::MAX).saturating_add(1)
    }

    /// Delay before the next attempt: the retry interval plus random jitter.
    #[must_use]
    pub fn backoff(&self) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.retry_interval() + Duration::from_millis(jitter)
    }
}

/// Cache warmer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WarmupConfig {
    /// How many top-ranked places feed the popularity set.
    pub top_places_limit: usize,
    /// How many places per city list.
    pub city_top_limit: u32,
    /// Cities whose top lists are pre-populated.
    pub cities: Vec<String>,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            top_places_limit: 100,
            city_top_limit: 50,
            cities: ["İstanbul", "Ankara", "İzmir", "Antalya", "Bursa"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}
