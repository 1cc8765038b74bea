//! Remote Store Implementations
//!
//! # Available Backends
//!
//! - **Redis** - shared tier for multi-process deployments (feature: `redis`, default)
//! - **`InMemory`** - `DashMap`-backed store for single-process deployments and tests
//!
//! # Usage
//!
//! ```rust,no_run
//! use place_cache::backends::{InMemoryStore, RedisStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let shared = RedisStore::with_url("redis://127.0.0.1:6379").await?;
//! let local = InMemoryStore::new();
//! # Ok(())
//! # }
//! ```

pub mod memory_store;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory_store::{InMemoryStore, PublishedMessage};

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
