//! Place Cache
//!
//! Multi-tier caching and cache invalidation for a read-heavy place/review
//! catalog:
//! - **L1**: bounded process-local tier with a short fixed TTL and
//!   insertion-order eviction
//! - **L2**: shared remote tier (Redis, or the in-process [`InMemoryStore`])
//! - **Stampede protection**: at most one fetch in flight per key across
//!   every process, via an expiring `lock:{key}` token
//! - **Pattern invalidation**: domain writes delete derived keys in both tiers
//!   and notify sibling processes
//! - **Specialized helpers**: popularity rankings, geo proximity, per-day view
//!   counters, rate-limit counters
//! - **Warm-up and monitoring**
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use place_cache::{CacheSystem, keys};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let system = CacheSystem::new().await?;
//!
//!     let key = keys::place_detail(42);
//!     let place: serde_json::Value = system
//!         .cache()
//!         .get_or_set(key.as_str(), || async { Ok(serde_json::json!({"id": 42})) }, key.ttl())
//!         .await?;
//!
//!     // after a write to place 42
//!     system.invalidation().on_place_update(42).await;
//!
//!     tracing::info!(hit_rate = %system.monitor().cache_hit_rate().await?, "cache ready");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Request → L1 (local) → L2 (remote) → fetch from source
//!           ↓ hit        ↓ hit         ↓ miss
//!           return       promote to L1 store in L1+L2
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

pub mod backends;
pub mod builder;
pub mod cache_service;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod keys;
pub mod local_tier;
pub mod monitoring;
pub mod pattern;
pub mod places;
pub mod traits;
pub mod warmer;

pub use backends::InMemoryStore;
#[cfg(feature = "redis")]
pub use backends::RedisStore;
pub use builder::CacheSystemBuilder;
pub use cache_service::{CacheService, ServiceStats};
pub use config::{CacheConfig, LocalTierConfig, LockConfig, WarmupConfig};
pub use error::CacheError;
#[cfg(feature = "redis")]
pub use invalidation::InvalidationSubscriber;
pub use invalidation::{InvalidationEvent, InvalidationKind, InvalidationService, InvalidationStats};
pub use keys::{CacheKey, KeyCategory};
pub use monitoring::{CacheMonitor, HitRate, StoreStats};
pub use pattern::KeyPattern;
pub use places::{NearbyPlace, PlaceCache, PlaceLocation, PopularPlace, RateLimitStatus};
pub use traits::{GeoMember, NoopPublisher, Publisher, RemoteStore};
pub use warmer::{CacheWarmer, WarmupReport, WarmupSource, WarmupStep};

// Re-export async_trait for implementors of the store traits
pub use async_trait::async_trait;

/// Main entry point: every cache service wired to one remote store.
///
/// Cheap to clone; clones share the same local tier and counters.
///
/// # Example
///
/// ```rust,no_run
/// use place_cache::CacheSystem;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let system = CacheSystem::new().await?;
///     let top = system.places().get_popular_places(0, 10).await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CacheSystem {
    cache: Arc<CacheService>,
    places: PlaceCache,
    invalidation: Arc<InvalidationService>,
    monitor: Arc<CacheMonitor>,
    warmer: Arc<CacheWarmer>,
    #[cfg(feature = "redis")]
    subscriber: Option<Arc<InvalidationSubscriber>>,
    local_listener: Option<Arc<tokio::task::JoinHandle<()>>>,
}

impl CacheSystem {
    /// Create a cache system from [`CacheConfig::from_env`] with the default backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the store cannot be reached.
    pub async fn new() -> Result<Self> {
        info!("Initializing place cache system");
        CacheSystemBuilder::new()
            .with_config(CacheConfig::from_env())
            .build()
            .await
    }

    /// Wire every service around an already-connected store and publisher.
    #[must_use]
    pub fn from_parts(store: Arc<dyn RemoteStore>, publisher: Arc<dyn Publisher>, config: &CacheConfig) -> Self {
        let cache = Arc::new(CacheService::new(store, config));
        Self {
            places: PlaceCache::new(Arc::clone(&cache)),
            invalidation: Arc::new(InvalidationService::new(
                Arc::clone(&cache),
                publisher,
                config.invalidation_channel.clone(),
            )),
            monitor: Arc::new(CacheMonitor::new(Arc::clone(&cache))),
            warmer: Arc::new(CacheWarmer::new(Arc::clone(&cache), config.warmup.clone())),
            cache,
            #[cfg(feature = "redis")]
            subscriber: None,
            local_listener: None,
        }
    }

    pub(crate) fn set_local_listener(&mut self, handle: tokio::task::JoinHandle<()>) {
        self.local_listener = Some(Arc::new(handle));
    }

    #[cfg(feature = "redis")]
    pub(crate) fn set_subscriber(&mut self, subscriber: Arc<InvalidationSubscriber>) {
        self.subscriber = Some(subscriber);
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    #[must_use]
    pub fn places(&self) -> &PlaceCache {
        &self.places
    }

    #[must_use]
    pub fn invalidation(&self) -> &InvalidationService {
        &self.invalidation
    }

    #[must_use]
    pub fn monitor(&self) -> &CacheMonitor {
        &self.monitor
    }

    /// Pre-populate the cache from `source`.
    pub async fn warm_up(&self, source: &dyn WarmupSource) -> WarmupReport {
        self.warmer.warm_up(source).await
    }

    /// Check the remote tier. L1 is in-process and always available.
    pub async fn health_check(&self) -> bool {
        let remote = self.cache.remote();
        if remote.ping().await {
            info!(backend = remote.name(), "Cache health check passed");
            true
        } else {
            warn!(backend = remote.name(), "Cache health check failed: remote store unreachable");
            false
        }
    }

    /// Stop the invalidation subscriber or in-process listener, if one was started.
    pub fn shutdown(&self) {
        #[cfg(feature = "redis")]
        if let Some(subscriber) = &self.subscriber {
            subscriber.shutdown();
        }
        if let Some(listener) = &self.local_listener {
            listener.abort();
        }
    }
}
