//! In-Memory Store - `DashMap`-backed remote tier
//!
//! Implements the full [`RemoteStore`] capability inside the process, with
//! Redis-compatible semantics for expiry, counters, ranked sets, geo radius
//! queries, sets and hashes. Used for single-process deployments and tests;
//! published invalidation events are delivered over a tokio broadcast channel.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::pattern::KeyPattern;
use crate::traits::{GeoMember, Publisher, RemoteStore};

/// Mean earth radius used by Redis geo commands, in meters.
const EARTH_RADIUS_M: f64 = 6_372_797.560_856;
/// Latitude bounds accepted by Redis `GEOADD`.
const GEO_LAT_LIMIT: f64 = 85.051_128_78;

#[derive(Debug, Clone)]
enum StoredValue {
    Bytes(Vec<u8>),
    SortedSet(Vec<(String, f64)>),
    Geo(Vec<GeoMember>),
    Set(BTreeSet<String>),
    Hash(HashMap<String, Vec<u8>>),
}

impl StoredValue {
    fn approx_size(&self) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::SortedSet(members) => members.iter().map(|(m, _)| m.len() + 8).sum(),
            Self::Geo(members) => members.iter().map(|m| m.member.len() + 16).sum(),
            Self::Set(members) => members.iter().map(String::len).sum(),
            Self::Hash(fields) => fields.iter().map(|(f, v)| f.len() + v.len()).sum(),
        }
    }
}

/// Stored value with expiration tracking
#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn persistent(value: StoredValue) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn expiring(value: StoredValue, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }
}

/// A message delivered through [`InMemoryStore`]'s publisher side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub channel: String,
    pub payload: String,
}

fn wrong_type() -> anyhow::Error {
    anyhow!("WRONGTYPE Operation against a key holding the wrong kind of value")
}

/// In-process implementation of the shared store.
///
/// **Limitations**:
/// - Shared only by clones of the same `Arc`, not across processes
/// - Expired entries are removed lazily on access or by [`cleanup_expired`](Self::cleanup_expired)
///
/// [`set_available`](Self::set_available) simulates an outage: every
/// operation fails until availability is restored.
pub struct InMemoryStore {
    map: Arc<DashMap<String, StoredEntry>>,
    available: AtomicBool,
    keyspace_hits: AtomicU64,
    keyspace_misses: AtomicU64,
    events: broadcast::Sender<PublishedMessage>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        info!("Initializing in-memory remote store (DashMap)");
        let (events, _) = broadcast::channel(256);
        Self {
            map: Arc::new(DashMap::new()),
            available: AtomicBool::new(true),
            keyspace_hits: AtomicU64::new(0),
            keyspace_misses: AtomicU64::new(0),
            events,
        }
    }

    /// Toggle simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Receive every message published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.events.subscribe()
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        self.map.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(count = removed, "[InMemory] Cleaned up expired entries");
        }
        removed
    }

    /// Number of stored keys (expired entries included until cleaned up).
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            bail!("in-memory store is unavailable")
        }
    }

    /// Run `f` on the live entry at `key`; expired entries are dropped.
    fn read<R>(&self, key: &str, f: impl FnOnce(&StoredValue) -> R) -> Option<R> {
        let expired = match self.map.get(key) {
            Some(entry) if !entry.is_expired() => return Some(f(&entry.value)),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.map.remove_if(key, |_, entry| entry.is_expired());
        }
        None
    }

    /// Run `f` on the live entry at `key`, creating it with `init` when absent or expired.
    fn upsert<R>(
        &self,
        key: &str,
        init: impl Fn() -> StoredValue,
        f: impl FnOnce(&mut StoredValue) -> Result<R>,
    ) -> Result<R> {
        let mut entry = self
            .map
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::persistent(init()));
        if entry.is_expired() {
            *entry = StoredEntry::persistent(init());
        }
        f(&mut entry.value)
    }

    fn replace(&self, key: &str, value: Option<StoredValue>, ttl: Duration) {
        match value {
            Some(value) => {
                self.map.insert(key.to_string(), StoredEntry::expiring(value, ttl));
            }
            None => {
                self.map.remove(key);
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Great-circle distance in kilometers.
fn haversine_km(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin() / 1000.0
}

// ===== Trait Implementations =====

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_available()?;
        let found = self.read(key, |value| match value {
            StoredValue::Bytes(bytes) => Ok(bytes.clone()),
            _ => Err(wrong_type()),
        });
        match found {
            Some(result) => {
                self.keyspace_hits.fetch_add(1, Ordering::Relaxed);
                result.map(Some)
            }
            None => {
                self.keyspace_misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        self.replace(key, Some(StoredValue::Bytes(value.to_vec())), ttl);
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[InMemory] Cached key with TTL");
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        self.ensure_available()?;
        Ok(keys
            .iter()
            .filter_map(|key| self.map.remove(key))
            .filter(|(_, entry)| !entry.is_expired())
            .count())
    }

    async fn keys_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        self.ensure_available()?;
        Ok(self
            .map
            .iter()
            .filter(|entry| !entry.is_expired() && pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn create_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.ensure_available()?;
        let fresh = || StoredEntry::expiring(StoredValue::Bytes(value.as_bytes().to_vec()), ttl);
        let created = match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(fresh());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh());
                true
            }
        };
        Ok(created)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self
            .map
            .remove_if(key, |_, entry| {
                !entry.is_expired()
                    && matches!(&entry.value, StoredValue::Bytes(bytes) if bytes == value.as_bytes())
            })
            .is_some())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.ensure_available()?;
        self.upsert(
            key,
            || StoredValue::Bytes(b"0".to_vec()),
            |value| match value {
                StoredValue::Bytes(bytes) => {
                    let current: i64 = std::str::from_utf8(bytes)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| anyhow!("ERR value is not an integer or out of range"))?;
                    let next = current
                        .checked_add(1)
                        .ok_or_else(|| anyhow!("ERR increment or decrement would overflow"))?;
                    *bytes = next.to_string().into_bytes();
                    Ok(next)
                }
                _ => Err(wrong_type()),
            },
        )
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.ensure_available()?;
        let expired = match self.map.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                return Ok(true);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.map.remove_if(key, |_, entry| entry.is_expired());
        }
        Ok(false)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.ensure_available()?;
        let now = Instant::now();
        Ok(self
            .map
            .get(key)
            .filter(|entry| !entry.is_expired())
            .and_then(|entry| entry.expires_at.map(|at| at.saturating_duration_since(now))))
    }

    async fn sorted_set_replace(&self, key: &str, members: &[(String, f64)], ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        let mut scores: HashMap<&str, f64> = HashMap::with_capacity(members.len());
        for (member, score) in members {
            scores.insert(member.as_str(), *score);
        }
        let set: Vec<(String, f64)> = scores
            .into_iter()
            .map(|(member, score)| (member.to_string(), score))
            .collect();
        let value = (!set.is_empty()).then_some(StoredValue::SortedSet(set));
        self.replace(key, value, ttl);
        Ok(())
    }

    async fn sorted_set_top_n(&self, key: &str, offset: usize, count: usize) -> Result<Vec<(String, f64)>> {
        self.ensure_available()?;
        let ranked = self.read(key, |value| match value {
            StoredValue::SortedSet(members) => {
                let mut ranked = members.clone();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
                Ok(ranked.into_iter().skip(offset).take(count).collect())
            }
            _ => Err(wrong_type()),
        });
        ranked.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn geo_replace(&self, key: &str, members: &[GeoMember], ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        if let Some(invalid) = members.iter().find(|m| {
            !(-180.0..=180.0).contains(&m.longitude) || !(-GEO_LAT_LIMIT..=GEO_LAT_LIMIT).contains(&m.latitude)
        }) {
            bail!(
                "ERR invalid longitude,latitude pair {},{}",
                invalid.longitude,
                invalid.latitude
            );
        }
        let mut index: Vec<GeoMember> = Vec::with_capacity(members.len());
        for member in members {
            index.retain(|existing| existing.member != member.member);
            index.push(member.clone());
        }
        let value = (!index.is_empty()).then_some(StoredValue::Geo(index));
        self.replace(key, value, ttl);
        Ok(())
    }

    async fn geo_radius(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        radius_km: f64,
    ) -> Result<Vec<(String, f64)>> {
        self.ensure_available()?;
        let found = self.read(key, |value| match value {
            StoredValue::Geo(members) => {
                let mut within: Vec<(String, f64)> = members
                    .iter()
                    .map(|m| (m.member.clone(), haversine_km(longitude, latitude, m.longitude, m.latitude)))
                    .filter(|(_, distance)| *distance <= radius_km)
                    .collect();
                within.sort_by(|a, b| a.1.total_cmp(&b.1));
                Ok(within)
            }
            _ => Err(wrong_type()),
        });
        found.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<usize> {
        self.ensure_available()?;
        if members.is_empty() {
            return Ok(0);
        }
        self.upsert(
            key,
            || StoredValue::Set(BTreeSet::new()),
            |value| match value {
                StoredValue::Set(set) => Ok(members.iter().filter(|m| set.insert((*m).clone())).count()),
                _ => Err(wrong_type()),
            },
        )
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let members = self.read(key, |value| match value {
            StoredValue::Set(set) => Ok(set.iter().cloned().collect()),
            _ => Err(wrong_type()),
        });
        members.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        self.ensure_available()?;
        self.upsert(
            key,
            || StoredValue::Hash(HashMap::new()),
            |stored| match stored {
                StoredValue::Hash(fields) => {
                    fields.insert(field.to_string(), value.to_vec());
                    Ok(())
                }
                _ => Err(wrong_type()),
            },
        )
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_available()?;
        let found = self.read(key, |value| match value {
            StoredValue::Hash(fields) => Ok(fields.get(field).cloned()),
            _ => Err(wrong_type()),
        });
        found.unwrap_or(Ok(None))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        self.ensure_available()?;
        let found = self.read(key, |value| match value {
            StoredValue::Hash(fields) => Ok(fields.clone()),
            _ => Err(wrong_type()),
        });
        found.unwrap_or_else(|| Ok(HashMap::new()))
    }

    async fn info(&self, section: &str) -> Result<String> {
        self.ensure_available()?;
        let body = match section {
            "stats" => format!(
                "# Stats\r\nkeyspace_hits:{}\r\nkeyspace_misses:{}\r\n",
                self.keyspace_hits.load(Ordering::Relaxed),
                self.keyspace_misses.load(Ordering::Relaxed),
            ),
            "memory" => {
                let used: usize = self
                    .map
                    .iter()
                    .map(|entry| entry.key().len() + entry.value.approx_size())
                    .sum();
                format!("# Memory\r\nused_memory:{used}\r\nmem_allocator:dashmap\r\n")
            }
            _ => String::new(),
        };
        Ok(body)
    }

    async fn ping(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "InMemory"
    }
}

#[async_trait]
impl Publisher for InMemoryStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.ensure_available()?;
        // No receivers is not an error for pub/sub.
        let _ = self.events.send(PublishedMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}
