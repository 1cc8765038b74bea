//! Integration tests for stampede protection
//!
//! Concurrent callers on a cold key, within one process and across
//! processes sharing a store.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::*;
use place_cache::{CacheConfig, CacheError, RemoteStore};
use tokio::task::JoinSet;

const TTL: Duration = Duration::from_secs(300);
const LOCK_TTL: Duration = Duration::from_secs(5);

/// Test stampede protection with concurrent requests
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cache_miss_fetches_once() {
    let (store, system) = setup_cache_system().await;
    let cache = Arc::clone(system.cache());
    let key = test_key("stampede");
    let compute_count = Arc::new(AtomicU32::new(0));

    let mut tasks = JoinSet::new();
    for _ in 0..50 {
        let cache = Arc::clone(&cache);
        let key = key.clone();
        let counter = Arc::clone(&compute_count);

        tasks.spawn(async move {
            cache
                .get_or_set_with_lock(
                    &key,
                    || async {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(test_data::json_place(42))
                    },
                    TTL,
                    LOCK_TTL,
                )
                .await
        });
    }

    let mut results = Vec::new();
    while let Some(result) = tasks.join_next().await {
        results.push(result.expect("Task panicked").expect("Fetch failed"));
    }

    let compute_calls = compute_count.load(Ordering::SeqCst);
    assert_eq!(compute_calls, 1, "Expected exactly 1 fetch, got {compute_calls}");
    assert_eq!(results.len(), 50);
    assert!(results.iter().all(|r| *r == test_data::json_place(42)));
    assert!(cache.stats().lock_waits > 0);

    // the lock token is gone once the winner finishes
    assert!(store.get(&format!("lock:{key}")).await.unwrap().is_none());
}

/// Processes with separate local tiers still fetch only once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stampede_across_processes() {
    let (store, first) = setup_cache_system().await;
    let second = system_on(&store, CacheConfig::default()).await;
    let key = test_key("shared");
    let compute_count = Arc::new(AtomicU32::new(0));

    let mut tasks = JoinSet::new();
    for i in 0..20 {
        let cache = if i % 2 == 0 {
            Arc::clone(first.cache())
        } else {
            Arc::clone(second.cache())
        };
        let key = key.clone();
        let counter = Arc::clone(&compute_count);
        tasks.spawn(async move {
            cache
                .get_or_set_with_lock(
                    &key,
                    || async {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(7_i64)
                    },
                    TTL,
                    LOCK_TTL,
                )
                .await
        });
    }

    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap().unwrap(), 7);
    }
    assert_eq!(compute_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_warm_cache_skips_lock() {
    let (store, system) = setup_cache_system().await;
    let cache = system.cache();
    cache.set("place:detail:1", &test_data::json_place(1), TTL).await.unwrap();

    let fetches = AtomicU32::new(0);
    let value: serde_json::Value = cache
        .get_or_set_with_lock(
            "place:detail:1",
            || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            },
            TTL,
            LOCK_TTL,
        )
        .await
        .unwrap();
    assert_eq!(value, test_data::json_place(1));
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
    assert!(store.get("lock:place:detail:1").await.unwrap().is_none());
    assert_eq!(cache.stats().lock_waits, 0);
}

/// A fetch failure is returned to the winner and the lock is released for the next caller
#[tokio::test]
async fn test_failed_fetch_releases_lock_for_next_caller() {
    let (store, system) = setup_cache_system().await;
    let cache = system.cache();

    let err = cache
        .get_or_set_with_lock::<i64, _, _>(
            "place:detail:9",
            || async { Err(anyhow::anyhow!("source unavailable")) },
            TTL,
            LOCK_TTL,
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "source unavailable");
    assert!(store.get("lock:place:detail:9").await.unwrap().is_none());

    let value: i64 = cache
        .get_or_set_with_lock("place:detail:9", || async { Ok(9) }, TTL, LOCK_TTL)
        .await
        .unwrap();
    assert_eq!(value, 9);
}

/// A holder that dies without releasing blocks others only until its lock expires
#[tokio::test(start_paused = true)]
async fn test_crashed_holder_lock_expires() {
    let (store, system) = setup_cache_system().await;
    store
        .create_if_absent("lock:place:detail:3", "dead-process", LOCK_TTL)
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let value: i64 = system
        .cache()
        .get_or_set_with_lock("place:detail:3", || async { Ok(3) }, TTL, LOCK_TTL)
        .await
        .unwrap();

    assert_eq!(value, 3);
    assert!(started.elapsed() >= LOCK_TTL);
}

#[tokio::test(start_paused = true)]
async fn test_bounded_wait_surfaces_timeout() {
    let mut config = CacheConfig::default();
    config.lock.max_wait_ms = 2_000;
    config.lock.jitter_ms = 0;
    let (store, system) = setup_with_config(config).await;
    store
        .create_if_absent("lock:slow", "other", Duration::from_secs(3_600))
        .await
        .unwrap();

    let err = system
        .cache()
        .get_or_set_with_lock::<i64, _, _>("slow", || async { Ok(1) }, TTL, Duration::from_secs(1))
        .await
        .unwrap_err();

    match err.downcast_ref::<CacheError>() {
        Some(CacheError::LockTimeout { key, attempts }) => {
            assert_eq!(key, "slow");
            assert_eq!(*attempts, 21);
        }
        other => panic!("expected lock timeout, got {other:?}"),
    }
}

/// A cancelled holder still releases its lock
#[tokio::test]
async fn test_cancelled_holder_releases_lock() {
    let (store, system) = setup_cache_system().await;
    let cache = Arc::clone(system.cache());

    let holder = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            cache
                .get_or_set_with_lock::<i64, _, _>(
                    "place:detail:11",
                    || async {
                        tokio::time::sleep(Duration::from_secs(3_600)).await;
                        Ok(11)
                    },
                    TTL,
                    Duration::from_secs(60),
                )
                .await
        })
    };

    // wait until the holder owns the lock
    let lock_key = "lock:place:detail:11";
    for _ in 0..100 {
        if store.get(lock_key).await.unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(store.get(lock_key).await.unwrap().is_some());

    holder.abort();
    let _ = holder.await;

    let mut released = false;
    for _ in 0..100 {
        if store.get(lock_key).await.unwrap().is_none() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(released, "lock was not released after cancellation");
}

#[tokio::test]
async fn test_place_detail_helper_uses_lock_path() {
    let (store, system) = setup_cache_system().await;
    let place: test_data::Place = system
        .places()
        .place_detail_cached(5, || async { Ok(test_data::Place::new(5)) })
        .await
        .unwrap();
    assert_eq!(place.id, 5);
    let remaining = store.ttl("place:detail:5").await.unwrap().unwrap();
    assert!(remaining > Duration::from_secs(3_500));
}
