//! Cache invalidation and cross-process synchronization
//!
//! Domain write events (place updated, review added, favorite added,
//! category updated) map to a fixed list of key patterns. Invalidating an
//! event deletes every pattern from both tiers concurrently, then publishes
//! an [`InvalidationEvent`] so sibling processes drop the same keys from
//! their local tier without waiting for the local TTL.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backends::PublishedMessage;
use crate::cache_service::CacheService;
use crate::keys;
use crate::pattern::KeyPattern;
use crate::traits::Publisher;

/// Domain write that triggered an invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationKind {
    PlaceUpdate,
    ReviewAdd,
    FavoriteAdd,
    CategoryUpdate,
}

/// Invalidation notification published after a confirmed domain write.
///
/// Wire format:
///
/// ```json
/// {"type":"favorite_add","entity_id":42,"user_id":7,"patterns":["user:favorites:7","place:stats:42"]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    #[serde(rename = "type")]
    pub kind: InvalidationKind,
    pub entity_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    pub patterns: Vec<String>,
}

impl InvalidationEvent {
    /// Serialize to JSON for transmission
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize invalidation event")
    }

    /// Deserialize from JSON
    ///
    /// # Errors
    ///
    /// Returns an error if `json` is not a valid event.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize invalidation event")
    }

    /// Evict this event's keys from `cache`'s local tier.
    ///
    /// Patterns that fail to compile are skipped with a warning.
    pub fn apply_local(&self, cache: &CacheService) -> usize {
        let patterns: Vec<KeyPattern> = self
            .patterns
            .iter()
            .filter_map(|raw| match KeyPattern::parse(raw) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %raw, error = %e, "Skipping invalid pattern in invalidation event");
                    None
                }
            })
            .collect();
        cache.evict_local(&patterns)
    }
}

/// Snapshot of invalidation counters
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationStats {
    /// Events published to the notification channel
    pub messages_sent: u64,
    /// Events that could not be published
    pub publish_errors: u64,
    /// Remote keys deleted by local invalidations
    pub keys_deleted: u64,
    /// Events received from the notification channel
    pub messages_received: u64,
    /// Local entries evicted because of received events
    pub local_evictions: u64,
    /// Received messages that could not be processed
    pub processing_errors: u64,
}

/// Thread-safe statistics for invalidation operations
#[derive(Debug, Default)]
pub struct AtomicInvalidationStats {
    pub messages_sent: AtomicU64,
    pub publish_errors: AtomicU64,
    pub keys_deleted: AtomicU64,
    pub messages_received: AtomicU64,
    pub local_evictions: AtomicU64,
    pub processing_errors: AtomicU64,
}

impl AtomicInvalidationStats {
    pub fn snapshot(&self) -> InvalidationStats {
        InvalidationStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            keys_deleted: self.keys_deleted.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            local_evictions: self.local_evictions.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
        }
    }
}

/// The pattern lists for each event kind, with the wildcards compiled once.
#[derive(Debug, Clone)]
struct InvalidationRules {
    place_update: Vec<KeyPattern>,
    review_add: Vec<KeyPattern>,
    category_update: Vec<KeyPattern>,
}

impl InvalidationRules {
    fn new() -> Self {
        let wildcard = |prefix: &str| KeyPattern::prefix(prefix);
        Self {
            place_update: vec![
                wildcard(keys::PLACE_LIST_PREFIX),
                wildcard(keys::TOP_PLACES_PREFIX),
                wildcard(keys::RECENT_PLACES_PREFIX),
                wildcard(keys::TRENDING_PLACES_PREFIX),
            ],
            review_add: vec![wildcard(keys::PLACE_LIST_PREFIX)],
            category_update: vec![
                KeyPattern::exact(keys::CATEGORIES_ALL),
                KeyPattern::exact(keys::CATEGORIES_TREE),
                wildcard(keys::PLACE_LIST_BY_CATEGORY_PREFIX),
            ],
        }
    }

    fn patterns_for(&self, kind: InvalidationKind, entity_id: i64, user_id: Option<i64>) -> Vec<KeyPattern> {
        let place_keys = || {
            vec![
                KeyPattern::exact(keys::place_detail(entity_id).into_string()),
                KeyPattern::exact(keys::place_stats(entity_id).into_string()),
            ]
        };

        match kind {
            InvalidationKind::PlaceUpdate => {
                let mut patterns = place_keys();
                patterns.extend(self.place_update.iter().cloned());
                patterns
            }
            InvalidationKind::ReviewAdd => {
                let mut patterns = place_keys();
                patterns.extend(self.review_add.iter().cloned());
                patterns
            }
            InvalidationKind::FavoriteAdd => {
                let mut patterns = Vec::with_capacity(2);
                if let Some(user_id) = user_id {
                    patterns.push(KeyPattern::exact(keys::user_favorites(user_id).into_string()));
                }
                patterns.push(KeyPattern::exact(keys::place_stats(entity_id).into_string()));
                patterns
            }
            InvalidationKind::CategoryUpdate => self.category_update.clone(),
        }
    }
}

/// Translates domain writes into cache invalidations.
pub struct InvalidationService {
    cache: Arc<CacheService>,
    publisher: Arc<dyn Publisher>,
    channel: String,
    rules: InvalidationRules,
    stats: AtomicInvalidationStats,
}

impl InvalidationService {
    pub fn new(cache: Arc<CacheService>, publisher: Arc<dyn Publisher>, channel: impl Into<String>) -> Self {
        Self {
            cache,
            publisher,
            channel: channel.into(),
            rules: InvalidationRules::new(),
            stats: AtomicInvalidationStats::default(),
        }
    }

    /// Invalidate everything derived from a place. Returns remote keys deleted.
    pub async fn on_place_update(&self, place_id: i64) -> usize {
        self.invalidate(InvalidationKind::PlaceUpdate, place_id, None).await
    }

    pub async fn on_review_add(&self, place_id: i64) -> usize {
        self.invalidate(InvalidationKind::ReviewAdd, place_id, None).await
    }

    pub async fn on_favorite_add(&self, user_id: i64, place_id: i64) -> usize {
        self.invalidate(InvalidationKind::FavoriteAdd, place_id, Some(user_id))
            .await
    }

    pub async fn on_category_update(&self, category_id: i64) -> usize {
        self.invalidate(InvalidationKind::CategoryUpdate, category_id, None)
            .await
    }

    /// Delete every pattern for the event in both tiers, then publish it.
    ///
    /// Best-effort: store and publish failures are logged and counted, never
    /// returned.
    pub async fn invalidate(&self, kind: InvalidationKind, entity_id: i64, user_id: Option<i64>) -> usize {
        let patterns = self.rules.patterns_for(kind, entity_id, user_id);

        let deleted: usize = join_all(patterns.iter().map(|p| self.cache.delete_by_pattern(p)))
            .await
            .into_iter()
            .sum();
        self.stats
            .keys_deleted
            .fetch_add(deleted as u64, Ordering::Relaxed);

        let event = InvalidationEvent {
            kind,
            entity_id,
            user_id,
            patterns: patterns.iter().map(ToString::to_string).collect(),
        };
        self.publish(&event).await;

        info!(kind = ?kind, entity_id = entity_id, deleted = deleted, "Invalidated cache entries");
        deleted
    }

    async fn publish(&self, event: &InvalidationEvent) {
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.publish_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Failed to encode invalidation event");
                return;
            }
        };

        match self.publisher.publish(&self.channel, &payload).await {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                debug!(channel = %self.channel, "Published invalidation event");
            }
            Err(e) => {
                self.stats.publish_errors.fetch_add(1, Ordering::Relaxed);
                warn!(channel = %self.channel, error = %e, "Failed to publish invalidation event");
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> InvalidationStats {
        self.stats.snapshot()
    }
}

/// Decode one received payload and apply it to the local tier.
fn handle_payload(payload: &str, cache: &CacheService, stats: &AtomicInvalidationStats) {
    match InvalidationEvent::from_json(payload) {
        Ok(event) => {
            stats.messages_received.fetch_add(1, Ordering::Relaxed);
            let evicted = event.apply_local(cache);
            stats
                .local_evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(kind = ?event.kind, entity_id = event.entity_id, evicted = evicted, "Applied invalidation event");
        }
        Err(e) => {
            stats.processing_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Failed to decode invalidation event");
        }
    }
}

/// Apply events published through an [`InMemoryStore`](crate::backends::InMemoryStore)
/// to `cache` until the sender side is dropped.
pub fn spawn_local_listener(
    mut receiver: broadcast::Receiver<PublishedMessage>,
    channel: String,
    cache: Arc<CacheService>,
    stats: Arc<AtomicInvalidationStats>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(message) if message.channel == channel => {
                    handle_payload(&message.payload, &cache, &stats);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    stats
                        .processing_errors
                        .fetch_add(skipped, Ordering::Relaxed);
                    warn!(skipped = skipped, "Invalidation listener lagged; clearing local tier");
                    cache.clear_local();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(feature = "redis")]
pub use subscriber::InvalidationSubscriber;

#[cfg(feature = "redis")]
mod subscriber {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use futures_util::StreamExt;
    use tokio::sync::broadcast;
    use tracing::{error, info, warn};

    use super::{AtomicInvalidationStats, InvalidationStats, handle_payload};
    use crate::cache_service::CacheService;

    /// Background task applying invalidation events from Redis Pub/Sub to a local tier.
    pub struct InvalidationSubscriber {
        client: redis::Client,
        channel: String,
        stats: Arc<AtomicInvalidationStats>,
        shutdown_tx: broadcast::Sender<()>,
    }

    impl InvalidationSubscriber {
        /// # Errors
        ///
        /// Returns an error if the Redis client cannot be created.
        pub fn new(redis_url: &str, channel: impl Into<String>) -> Result<Self> {
            let client = redis::Client::open(redis_url)
                .context("Failed to create Redis client for subscriber")?;
            let (shutdown_tx, _) = broadcast::channel(1);

            Ok(Self {
                client,
                channel: channel.into(),
                stats: Arc::new(AtomicInvalidationStats::default()),
                shutdown_tx,
            })
        }

        #[must_use]
        pub fn stats(&self) -> InvalidationStats {
            self.stats.snapshot()
        }

        /// Start the subscriber; reconnects after 5s whenever the connection drops.
        pub fn start(&self, cache: Arc<CacheService>) -> tokio::task::JoinHandle<()> {
            let client = self.client.clone();
            let channel = self.channel.clone();
            let stats = Arc::clone(&self.stats);
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                loop {
                    if shutdown_rx.try_recv().is_ok() {
                        info!("Invalidation subscriber shutting down...");
                        break;
                    }

                    match Self::run_subscriber_loop(&client, &channel, &cache, &stats, &mut shutdown_rx).await {
                        Ok(()) => {
                            info!("Invalidation subscriber loop completed normally");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Invalidation subscriber error. Reconnecting in 5s...");
                            stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                            // Events may have been missed while disconnected.
                            cache.clear_local();

                            tokio::select! {
                                () = tokio::time::sleep(Duration::from_secs(5)) => {},
                                _ = shutdown_rx.recv() => {
                                    info!("Invalidation subscriber shutting down...");
                                    break;
                                }
                            }
                        }
                    }
                }
            })
        }

        async fn run_subscriber_loop(
            client: &redis::Client,
            channel: &str,
            cache: &CacheService,
            stats: &AtomicInvalidationStats,
            shutdown_rx: &mut broadcast::Receiver<()>,
        ) -> Result<()> {
            let mut pubsub = client
                .get_async_pubsub()
                .await
                .context("Failed to get pubsub connection")?;

            pubsub
                .subscribe(channel)
                .await
                .context("Failed to subscribe to channel")?;

            info!(channel = %channel, "Subscribed to invalidation channel");

            let mut stream = pubsub.on_message();

            loop {
                tokio::select! {
                    msg_result = stream.next() => {
                        let Some(msg) = msg_result else {
                            return Err(anyhow::anyhow!("Pub/Sub message stream ended"));
                        };
                        match msg.get_payload::<String>() {
                            Ok(payload) => handle_payload(&payload, cache, stats),
                            Err(e) => {
                                warn!(error = %e, "Failed to get message payload");
                                stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        return Ok(());
                    }
                }
            }
        }

        /// Signal the subscriber to shutdown
        pub fn shutdown(&self) {
            let _ = self.shutdown_tx.send(());
        }
    }
}
