//! Common utilities for integration tests
//!
//! Every test runs against an [`InMemoryStore`] so no Redis is required:
//! - Cache system setup helpers
//! - Test data generators
//! - A scriptable warm-up data source

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Result, bail};
use place_cache::{
    CacheConfig, CacheSystem, CacheSystemBuilder, InMemoryStore, LocalTierConfig, PlaceLocation,
    PopularPlace, WarmupSource, async_trait,
};

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a test key with a unique suffix
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// A cache system over a fresh in-memory store, default config.
pub async fn setup_cache_system() -> (Arc<InMemoryStore>, CacheSystem) {
    setup_with_config(CacheConfig::default()).await
}

pub async fn setup_with_config(config: CacheConfig) -> (Arc<InMemoryStore>, CacheSystem) {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let system = system_on(&store, config).await;
    (store, system)
}

/// A second "process" sharing `store`, with its own local tier.
pub async fn system_on(store: &Arc<InMemoryStore>, config: CacheConfig) -> CacheSystem {
    CacheSystemBuilder::new()
        .with_config(config)
        .with_backend(Arc::clone(store))
        .build()
        .await
        .expect("Failed to build cache system")
}

/// Config with a small local tier.
pub fn small_local_config(capacity: usize) -> CacheConfig {
    CacheConfig {
        local: LocalTierConfig {
            capacity,
            ttl_ms: 60_000,
        },
        ..CacheConfig::default()
    }
}

/// Generate test data of various types
pub mod test_data {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Place {
        pub id: i64,
        pub name: String,
        pub city: String,
        pub rating: f64,
    }

    impl Place {
        pub fn new(id: i64) -> Self {
            Self {
                id,
                name: format!("Place {id}"),
                city: "İstanbul".to_string(),
                rating: 4.0 + (id % 10) as f64 / 10.0,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct PlaceFilters {
        pub city: Option<String>,
        pub category_id: Option<i64>,
        pub page: u32,
        pub limit: u32,
    }

    pub fn json_place(id: i64) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": format!("Place {id}"),
        })
    }
}

/// Warm-up source with canned data; individual steps can be made to fail.
#[derive(Default)]
pub struct TestSource {
    pub fail_top_places: bool,
    pub fail_locations: bool,
    pub fail_categories: bool,
    pub fail_city: Option<String>,
    pub calls: AtomicU32,
}

#[async_trait]
impl WarmupSource for TestSource {
    async fn top_places(&self, limit: usize) -> Result<Vec<PopularPlace>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_top_places {
            bail!("top places query failed");
        }
        Ok((1..=3)
            .take(limit)
            .map(|id| PopularPlace {
                id,
                popularity_score: id as f64 * 10.0,
            })
            .collect())
    }

    async fn place_locations(&self) -> Result<Vec<PlaceLocation>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_locations {
            bail!("locations query failed");
        }
        Ok(vec![
            PlaceLocation {
                id: 1,
                latitude: Some(41.0054),
                longitude: Some(28.9768),
            },
            PlaceLocation {
                id: 2,
                latitude: None,
                longitude: Some(28.9850),
            },
        ])
    }

    async fn active_categories(&self) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_categories {
            bail!("categories query failed");
        }
        Ok(serde_json::json!([{"id": 1, "name": "Müze"}, {"id": 2, "name": "Restoran"}]))
    }

    async fn top_places_by_city(&self, city: &str, limit: u32) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_city.as_deref() == Some(city) {
            bail!("city query failed for {city}");
        }
        Ok(serde_json::json!({"city": city, "limit": limit, "places": [1, 2]}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let key1 = test_key("place");
        let key2 = test_key("place");
        assert_ne!(key1, key2, "Keys should be unique");
        assert!(key1.starts_with("test_place_"));
    }
}
