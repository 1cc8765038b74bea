//! Integration tests for cache invalidation
//!
//! Domain write events, their key patterns, and propagation of local
//! evictions to sibling processes sharing the same store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use anyhow::Result;
use place_cache::invalidation::{AtomicInvalidationStats, spawn_local_listener};
use place_cache::{
    CacheConfig, CacheSystemBuilder, GeoMember, InMemoryStore, InvalidationEvent, InvalidationKind, KeyPattern,
    Publisher, RemoteStore, async_trait, keys,
};
use serde_json::json;

const TTL: Duration = Duration::from_secs(3_600);

/// In-memory store whose key scans and deletes take `delay` to complete.
struct SlowStore {
    inner: InMemoryStore,
    delay: Duration,
}

#[async_trait]
impl RemoteStore for SlowStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(keys).await
    }

    async fn keys_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        tokio::time::sleep(self.delay).await;
        self.inner.keys_matching(pattern).await
    }

    async fn create_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.inner.create_if_absent(key, value, ttl).await
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        self.inner.delete_if_equals(key, value).await
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.inner.increment(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.inner.ttl(key).await
    }

    async fn sorted_set_replace(&self, key: &str, members: &[(String, f64)], ttl: Duration) -> Result<()> {
        self.inner.sorted_set_replace(key, members, ttl).await
    }

    async fn sorted_set_top_n(&self, key: &str, offset: usize, count: usize) -> Result<Vec<(String, f64)>> {
        self.inner.sorted_set_top_n(key, offset, count).await
    }

    async fn geo_replace(&self, key: &str, members: &[GeoMember], ttl: Duration) -> Result<()> {
        self.inner.geo_replace(key, members, ttl).await
    }

    async fn geo_radius(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        radius_km: f64,
    ) -> Result<Vec<(String, f64)>> {
        self.inner.geo_radius(key, longitude, latitude, radius_km).await
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<usize> {
        self.inner.set_add(key, members).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.inner.set_members(key).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        self.inner.hash_set(key, field, value).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.inner.hash_get(key, field).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<std::collections::HashMap<String, Vec<u8>>> {
        self.inner.hash_get_all(key).await
    }

    async fn info(&self, section: &str) -> Result<String> {
        self.inner.info(section).await
    }

    async fn ping(&self) -> bool {
        self.inner.ping().await
    }
}

async fn slow_system() -> place_cache::CacheSystem {
    init_tracing();
    let store = Arc::new(SlowStore {
        inner: InMemoryStore::new(),
        delay: Duration::from_millis(50),
    });
    CacheSystemBuilder::new().with_store(store).build().await.unwrap()
}

#[tokio::test]
async fn test_place_update_drops_stale_detail() {
    let (store, system) = setup_cache_system().await;
    let cache = system.cache();

    cache
        .set("place:detail:42", &json!({"id": 42, "name": "Old name"}), TTL)
        .await
        .unwrap();

    let deleted = system.invalidation().on_place_update(42).await;
    assert_eq!(deleted, 1);

    assert_eq!(cache.get::<serde_json::Value>("place:detail:42").await, None);
    assert!(store.get("place:detail:42").await.unwrap().is_none());
}

/// Test that a place update clears every derived listing and nothing unrelated
#[tokio::test]
async fn test_place_update_clears_derived_lists() {
    let (store, system) = setup_cache_system().await;
    let cache = system.cache();

    let derived = [
        "place:detail:7",
        "place:stats:7",
        "place:list:3f2a",
        "place:list:city:Ankara:1:20",
        "place:top:10",
        "place:recent:20",
        "place:trending:10",
    ];
    for key in derived {
        cache.set(key, &json!([7]), TTL).await.unwrap();
    }
    cache.set("place:detail:8", &json!({"id": 8}), TTL).await.unwrap();
    cache.set("categories:all", &json!([]), TTL).await.unwrap();

    let deleted = system.invalidation().on_place_update(7).await;
    assert_eq!(deleted, derived.len());

    for key in derived {
        assert!(store.get(key).await.unwrap().is_none(), "{key} survived");
        assert_eq!(cache.get::<serde_json::Value>(key).await, None, "{key} survived locally");
    }
    assert!(cache.get::<serde_json::Value>("place:detail:8").await.is_some());
    assert!(cache.get::<serde_json::Value>("categories:all").await.is_some());
}

#[tokio::test]
async fn test_review_add_keeps_rankings() {
    let (_store, system) = setup_cache_system().await;
    let cache = system.cache();

    for key in ["place:detail:3", "place:stats:3", "place:list:abc", "place:top:10"] {
        cache.set(key, &1, TTL).await.unwrap();
    }

    assert_eq!(system.invalidation().on_review_add(3).await, 3);
    assert_eq!(cache.get::<i64>("place:stats:3").await, None);
    assert_eq!(cache.get::<i64>("place:list:abc").await, None);
    assert_eq!(cache.get::<i64>("place:top:10").await, Some(1));
}

#[tokio::test]
async fn test_favorite_add_publishes_user_scoped_event() {
    let (store, system) = setup_cache_system().await;
    let cache = system.cache();
    let mut events = store.subscribe();

    let favorites = keys::user_favorites(8);
    cache.set(favorites.as_str(), &vec![3, 4], favorites.ttl()).await.unwrap();
    cache.set("place:stats:3", &json!({"favorites": 1}), TTL).await.unwrap();
    cache.set("user:favorites:9", &vec![1], TTL).await.unwrap();

    assert_eq!(system.invalidation().on_favorite_add(8, 3).await, 2);
    assert_eq!(cache.get::<Vec<i64>>("user:favorites:9").await, Some(vec![1]));

    let message = events.recv().await.unwrap();
    assert_eq!(message.channel, "cache:invalidate");
    let event = InvalidationEvent::from_json(&message.payload).unwrap();
    assert_eq!(event.kind, InvalidationKind::FavoriteAdd);
    assert_eq!(event.entity_id, 3);
    assert_eq!(event.user_id, Some(8));
    assert_eq!(event.patterns, vec!["user:favorites:8", "place:stats:3"]);
}

#[tokio::test]
async fn test_category_update_clears_category_keys() {
    let (_store, system) = setup_cache_system().await;
    let cache = system.cache();

    let all = keys::categories_all();
    cache.set(all.as_str(), &json!([{"id": 1}]), all.ttl()).await.unwrap();
    cache.set("categories:tree", &json!({}), TTL).await.unwrap();
    cache.set("place:list:cat:1:1:20", &json!([]), TTL).await.unwrap();
    cache.set("place:list:city:Bursa:1:20", &json!([]), TTL).await.unwrap();

    assert_eq!(system.invalidation().on_category_update(1).await, 3);
    assert_eq!(cache.get::<serde_json::Value>("categories:all").await, None);
    assert!(cache.get::<serde_json::Value>("place:list:city:Bursa:1:20").await.is_some());
}

/// Invalidating with nothing cached is a no-op that still notifies siblings
#[tokio::test]
async fn test_invalidation_with_nothing_cached() {
    let (store, system) = setup_cache_system().await;
    let mut events = store.subscribe();

    assert_eq!(system.invalidation().on_place_update(1_000).await, 0);
    assert!(events.recv().await.is_ok());

    let stats = system.invalidation().stats();
    assert_eq!(stats.messages_sent, 1);
    assert_eq!(stats.keys_deleted, 0);
}

/// Test cross-process local eviction via the notification channel
#[tokio::test]
async fn test_sibling_local_tier_is_evicted() {
    let (store, writer) = setup_cache_system().await;
    let reader = system_on(&store, CacheConfig::default()).await;
    let listener_stats = Arc::new(AtomicInvalidationStats::default());
    let listener = spawn_local_listener(
        store.subscribe(),
        "cache:invalidate".to_string(),
        Arc::clone(reader.cache()),
        Arc::clone(&listener_stats),
    );

    writer
        .cache()
        .set("place:detail:42", &json!({"name": "Old name"}), TTL)
        .await
        .unwrap();
    // the reader now holds its own local copy
    assert!(reader.cache().get::<serde_json::Value>("place:detail:42").await.is_some());

    writer.invalidation().on_place_update(42).await;

    let mut evicted = false;
    for _ in 0..100 {
        if reader.cache().get::<serde_json::Value>("place:detail:42").await.is_none() {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(evicted, "reader kept a stale local copy");

    let stats = listener_stats.snapshot();
    assert_eq!(stats.messages_received, 1);
    assert_eq!(stats.local_evictions, 1);
    assert_eq!(stats.processing_errors, 0);
    listener.abort();
}

#[tokio::test]
async fn test_listener_ignores_other_channels_and_bad_payloads() {
    let (store, system) = setup_cache_system().await;
    let stats = Arc::new(AtomicInvalidationStats::default());
    let listener = spawn_local_listener(
        store.subscribe(),
        "cache:invalidate".to_string(),
        Arc::clone(system.cache()),
        Arc::clone(&stats),
    );

    system.cache().set("place:detail:1", &1, TTL).await.unwrap();
    let event = InvalidationEvent {
        kind: InvalidationKind::PlaceUpdate,
        entity_id: 1,
        user_id: None,
        patterns: vec!["place:detail:1".to_string()],
    };

    store.publish("other:channel", &event.to_json().unwrap()).await.unwrap();
    store.publish("cache:invalidate", "not json").await.unwrap();

    for _ in 0..100 {
        if stats.snapshot().processing_errors == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.processing_errors, 1);
    assert_eq!(snapshot.messages_received, 0);
    assert_eq!(system.cache().get::<i64>("place:detail:1").await, Some(1));
    listener.abort();
}

/// Invalidation keeps going when the store is down; publish failures are counted
#[tokio::test]
async fn test_invalidation_during_outage() {
    let (store, system) = setup_cache_system().await;
    system.cache().set("place:detail:5", &5, TTL).await.unwrap();
    store.set_available(false);

    assert_eq!(system.invalidation().on_place_update(5).await, 0);
    // the local copy is still dropped
    assert_eq!(system.cache().get::<i64>("place:detail:5").await, None);

    let stats = system.invalidation().stats();
    assert_eq!(stats.publish_errors, 1);
    assert_eq!(stats.messages_sent, 0);
}

/// A read arriving while an invalidation is still talking to the store must
/// not leave the old value in the local tier once the invalidation returns.
#[tokio::test(start_paused = true)]
async fn test_read_during_invalidation_leaves_no_stale_local_copy() {
    let system = slow_system().await;
    let cache = Arc::clone(system.cache());
    cache.set("place:detail:42", &"stale detail", TTL).await.unwrap();
    cache.set("place:list:a", &"stale list", TTL).await.unwrap();

    let invalidation = {
        let system = system.clone();
        tokio::spawn(async move { system.invalidation().on_place_update(42).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!invalidation.is_finished());
    let during_detail = cache.get::<String>("place:detail:42").await;
    let during_list = cache.get::<String>("place:list:a").await;
    assert!(during_detail.is_some());
    assert!(during_list.is_some());

    assert_eq!(invalidation.await.unwrap(), 2);
    assert_eq!(cache.get::<String>("place:detail:42").await, None);
    assert_eq!(cache.get::<String>("place:list:a").await, None);
}

#[tokio::test(start_paused = true)]
async fn test_read_during_delete_leaves_no_stale_local_copy() {
    let system = slow_system().await;
    let cache = Arc::clone(system.cache());
    cache.set("place:stats:9", &"stale", TTL).await.unwrap();

    let delete = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.delete("place:stats:9").await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(cache.get::<String>("place:stats:9").await.is_some());

    delete.await.unwrap();
    assert_eq!(cache.get::<String>("place:stats:9").await, None);
}
