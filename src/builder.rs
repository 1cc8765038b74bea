//! Cache System Builder
//!
//! Wires a [`CacheSystem`] from a remote store, a publisher and a config.
//!
//! # Example: Using Default Backends
//!
//! ```rust,no_run
//! use place_cache::CacheSystemBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Redis from CacheConfig::redis_url, with an invalidation subscriber
//!     let cache = CacheSystemBuilder::new()
//!         .build()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: In-Process Store
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use place_cache::{CacheSystemBuilder, backends::InMemoryStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = CacheSystemBuilder::new()
//!     .with_memory_store(Arc::new(InMemoryStore::new()))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::CacheSystem;
use crate::backends::InMemoryStore;
use crate::config::CacheConfig;
use crate::invalidation::{AtomicInvalidationStats, spawn_local_listener};
use crate::traits::{NoopPublisher, Publisher, RemoteStore};

/// Builder for constructing a [`CacheSystem`] with injected backends
///
/// # Default Behavior
///
/// With no store configured, `build()` connects to Redis at
/// [`CacheConfig::redis_url`], publishes invalidations through it and starts
/// an [`InvalidationSubscriber`](crate::invalidation::InvalidationSubscriber)
/// for this process's local tier. A custom store without a publisher gets a
/// [`NoopPublisher`].
///
/// Only the Redis default and [`with_memory_store`](Self::with_memory_store)
/// listen for invalidations from sibling systems. With [`with_store`](Self::with_store)
/// or [`with_backend`](Self::with_backend) the caller wires delivery itself,
/// e.g. with [`spawn_local_listener`].
pub struct CacheSystemBuilder {
    config: CacheConfig,
    store: Option<Arc<dyn RemoteStore>>,
    publisher: Option<Arc<dyn Publisher>>,
    memory_store: Option<Arc<InMemoryStore>>,
    subscribe: bool,
}

impl CacheSystemBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            store: None,
            publisher: None,
            memory_store: None,
            subscribe: true,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom shared tier.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom invalidation publisher.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Use one backend as both store and publisher.
    #[must_use]
    pub fn with_backend<B>(mut self, backend: Arc<B>) -> Self
    where
        B: RemoteStore + Publisher + 'static,
    {
        self.store = Some(Arc::clone(&backend) as Arc<dyn RemoteStore>);
        self.publisher = Some(backend as Arc<dyn Publisher>);
        self
    }

    /// Share an in-process store with other systems in this process.
    ///
    /// The store is also the publisher, and `build()` starts a listener that
    /// applies invalidations published by sibling systems to this local tier.
    #[must_use]
    pub fn with_memory_store(mut self, store: Arc<InMemoryStore>) -> Self {
        self.memory_store = Some(Arc::clone(&store));
        self.with_backend(store)
    }

    /// Whether `build()` also listens for sibling invalidations (default: on).
    #[must_use]
    pub fn with_subscriber(mut self, enabled: bool) -> Self {
        self.subscribe = enabled;
        self
    }

    /// Build the cache system.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the default Redis
    /// backend cannot be reached.
    pub async fn build(self) -> Result<CacheSystem> {
        self.config.validate()?;

        let Self {
            config,
            store,
            publisher,
            memory_store,
            subscribe,
        } = self;

        if let Some(store) = store {
            info!(backend = store.name(), "Building cache system with custom store");
            let publisher = publisher.unwrap_or_else(|| Arc::new(NoopPublisher) as Arc<dyn Publisher>);
            let mut system = CacheSystem::from_parts(store, publisher, &config);
            if let Some(memory) = memory_store.filter(|_| subscribe) {
                Self::listen_locally(&mut system, &memory, &config);
            }
            return Ok(system);
        }

        Self::build_default(config, publisher, subscribe).await
    }

    #[cfg(feature = "redis")]
    async fn build_default(
        config: CacheConfig,
        publisher: Option<Arc<dyn Publisher>>,
        subscribe: bool,
    ) -> Result<CacheSystem> {
        use crate::backends::RedisStore;
        use crate::invalidation::InvalidationSubscriber;

        let redis = Arc::new(RedisStore::with_url(&config.redis_url).await?);
        let publisher = publisher.unwrap_or_else(|| Arc::clone(&redis) as Arc<dyn Publisher>);
        let mut system = CacheSystem::from_parts(redis, publisher, &config);

        if subscribe {
            let subscriber = InvalidationSubscriber::new(&config.redis_url, config.invalidation_channel.clone())?;
            subscriber.start(Arc::clone(system.cache()));
            system.set_subscriber(Arc::new(subscriber));
        }

        info!(redis_url = %config.redis_url, "Cache system ready");
        Ok(system)
    }

    #[cfg(not(feature = "redis"))]
    async fn build_default(
        config: CacheConfig,
        publisher: Option<Arc<dyn Publisher>>,
        subscribe: bool,
    ) -> Result<CacheSystem> {
        let store = Arc::new(InMemoryStore::new());
        let publisher = publisher.unwrap_or_else(|| Arc::clone(&store) as Arc<dyn Publisher>);
        tracing::warn!("Built without the redis feature; using the in-memory store");
        let mut system = CacheSystem::from_parts(Arc::clone(&store) as Arc<dyn RemoteStore>, publisher, &config);
        if subscribe {
            Self::listen_locally(&mut system, &store, &config);
        }
        Ok(system)
    }

    fn listen_locally(system: &mut CacheSystem, store: &InMemoryStore, config: &CacheConfig) {
        let handle = spawn_local_listener(
            store.subscribe(),
            config.invalidation_channel.clone(),
            Arc::clone(system.cache()),
            Arc::new(AtomicInvalidationStats::default()),
        );
        system.set_local_listener(handle);
        info!(channel = %config.invalidation_channel, "Listening for in-process invalidations");
    }
}

impl Default for CacheSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}
