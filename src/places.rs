//! Place-specific cache access
//!
//! Ranked popularity sets, geospatial proximity, per-day view counters and
//! rate-limit counters, plus the cached lookups the catalog's read paths
//! use. All of them are built on [`CacheService`] and its remote store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache_service::CacheService;
use crate::keys;
use crate::traits::GeoMember;

/// Radius used by [`PlaceCache::get_nearby_places`] when none is given.
pub const DEFAULT_NEARBY_RADIUS_KM: f64 = 5.0;

/// Lock TTL guarding place detail population.
pub const PLACE_DETAIL_LOCK_TTL: Duration = Duration::from_secs(10);

/// Latitude limit of geo indexes (Web Mercator).
const MAX_GEO_LATITUDE: f64 = 85.051_128_78;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopularPlace {
    pub id: i64,
    pub popularity_score: f64,
}

/// A place's coordinates as stored in the catalog; either may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceLocation {
    pub id: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl PlaceLocation {
    fn to_geo_member(&self) -> Option<GeoMember> {
        let (latitude, longitude) = (self.latitude?, self.longitude?);
        let valid = (-MAX_GEO_LATITUDE..=MAX_GEO_LATITUDE).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then(|| GeoMember {
            member: self.id.to_string(),
            longitude,
            latitude,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyPlace {
    pub id: i64,
    pub distance_km: f64,
}

/// Outcome of one rate-limited request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    /// Requests counted in the current window, this one included.
    pub count: i64,
    pub limit: i64,
    pub allowed: bool,
}

fn parse_member(member: &str) -> Option<i64> {
    match member.parse() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!(member = %member, "Skipping non-numeric place id in index");
            None
        }
    }
}

/// Place-specific helpers over a shared [`CacheService`].
#[derive(Clone)]
pub struct PlaceCache {
    cache: Arc<CacheService>,
}

impl PlaceCache {
    #[must_use]
    pub fn new(cache: Arc<CacheService>) -> Self {
        Self { cache }
    }

    /// Replace the popularity ranking.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn cache_popular_places(&self, places: &[PopularPlace]) -> Result<()> {
        let key = keys::popular_places();
        let members: Vec<(String, f64)> = places
            .iter()
            .map(|p| (p.id.to_string(), p.popularity_score))
            .collect();
        self.cache
            .remote()
            .sorted_set_replace(key.as_str(), &members, key.ttl())
            .await?;
        debug!(count = members.len(), "Cached popular places");
        Ok(())
    }

    /// Ids of up to `limit` places starting at rank `offset`, most popular first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn get_popular_places(&self, offset: usize, limit: usize) -> Result<Vec<i64>> {
        let ranked = self.get_popular_places_with_scores(offset, limit).await?;
        Ok(ranked.into_iter().map(|p| p.id).collect())
    }

    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn get_popular_places_with_scores(&self, offset: usize, limit: usize) -> Result<Vec<PopularPlace>> {
        let key = keys::popular_places();
        let ranked = self
            .cache
            .remote()
            .sorted_set_top_n(key.as_str(), offset, limit)
            .await?;
        Ok(ranked
            .into_iter()
            .filter_map(|(member, score)| {
                parse_member(&member).map(|id| PopularPlace {
                    id,
                    popularity_score: score,
                })
            })
            .collect())
    }

    /// Replace the geo index. Places without valid coordinates are left out.
    ///
    /// Returns how many places were indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn cache_place_locations(&self, locations: &[PlaceLocation]) -> Result<usize> {
        let key = keys::place_locations();
        let members: Vec<GeoMember> = locations.iter().filter_map(PlaceLocation::to_geo_member).collect();
        let skipped = locations.len() - members.len();
        if skipped > 0 {
            debug!(skipped = skipped, "Skipped places without valid coordinates");
        }
        self.cache
            .remote()
            .geo_replace(key.as_str(), &members, key.ttl())
            .await?;
        debug!(count = members.len(), "Cached place locations");
        Ok(members.len())
    }

    /// Places within `radius_km` (default 5 km) of a point, nearest first.
    ///
    /// Longitude comes first, as in [`RemoteStore::geo_radius`](crate::traits::RemoteStore::geo_radius).
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn get_nearby_places(
        &self,
        longitude: f64,
        latitude: f64,
        radius_km: Option<f64>,
    ) -> Result<Vec<NearbyPlace>> {
        let radius_km = radius_km.unwrap_or(DEFAULT_NEARBY_RADIUS_KM);
        if radius_km.is_nan() || radius_km <= 0.0 {
            return Ok(Vec::new());
        }
        let key = keys::place_locations();
        let found = self
            .cache
            .remote()
            .geo_radius(key.as_str(), longitude, latitude, radius_km)
            .await?;
        Ok(found
            .into_iter()
            .filter_map(|(member, distance_km)| parse_member(&member).map(|id| NearbyPlace { id, distance_km }))
            .collect())
    }

    /// Count a view of `place_id` today (UTC). Returns the day's count so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn increment_place_view(&self, place_id: i64) -> Result<i64> {
        self.increment_place_view_on(place_id, chrono::Utc::now().date_naive())
            .await
    }

    /// Count a view of `place_id` on `day`. The counter's week-long TTL is
    /// set by the first view only.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn increment_place_view_on(&self, place_id: i64, day: NaiveDate) -> Result<i64> {
        let key = keys::place_view_count(place_id, day);
        self.cache.increment_with_ttl(key.as_str(), key.ttl()).await
    }

    /// Count a request from `identifier` to `endpoint` in the current minute.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails; the caller decides
    /// whether to fail open or closed.
    pub async fn check_rate_limit(&self, identifier: &str, endpoint: &str, limit: i64) -> Result<RateLimitStatus> {
        let key = keys::rate_limit(identifier, endpoint);
        let count = self.cache.increment_with_ttl(key.as_str(), key.ttl()).await?;
        let allowed = count <= limit;
        if !allowed {
            debug!(identifier = %identifier, endpoint = %endpoint, count = count, "Rate limit exceeded");
        }
        Ok(RateLimitStatus { count, limit, allowed })
    }

    /// Place detail, populated by at most one caller at a time.
    ///
    /// # Errors
    ///
    /// Returns the error from `fetch`, or a lock timeout.
    pub async fn place_detail_cached<T, F, Fut>(&self, place_id: i64, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let key = keys::place_detail(place_id);
        self.cache
            .get_or_set_with_lock(key.as_str(), fetch, key.ttl(), PLACE_DETAIL_LOCK_TTL)
            .await
    }

    /// A filtered place list, keyed by a hash of `params`.
    ///
    /// # Errors
    ///
    /// Returns an error if `params` cannot be hashed, or the error from `fetch`.
    pub async fn place_list_cached<P, T, F, Fut>(&self, params: &P, fetch: F) -> Result<T>
    where
        P: Serialize + ?Sized,
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let key = keys::place_list(params)?;
        self.cache.get_or_set(key.as_str(), fetch, key.ttl()).await
    }

    /// # Errors
    ///
    /// Returns the error from `fetch`.
    pub async fn top_places_cached<T, F, Fut>(&self, limit: u32, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let key = keys::top_places(limit);
        self.cache.get_or_set(key.as_str(), fetch, key.ttl()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_validation() {
        let at = |latitude, longitude| PlaceLocation {
            id: 1,
            latitude,
            longitude,
        };
        assert!(at(Some(41.0), Some(29.0)).to_geo_member().is_some());
        assert!(at(Some(0.0), Some(0.0)).to_geo_member().is_some());
        assert!(at(None, Some(29.0)).to_geo_member().is_none());
        assert!(at(Some(41.0), None).to_geo_member().is_none());
        assert!(at(Some(89.0), Some(29.0)).to_geo_member().is_none());
        assert!(at(Some(41.0), Some(181.0)).to_geo_member().is_none());
    }

    #[test]
    fn test_geo_member_uses_place_id() {
        let member = PlaceLocation {
            id: 42,
            latitude: Some(41.0),
            longitude: Some(29.0),
        }
        .to_geo_member()
        .unwrap();
        assert_eq!(member.member, "42");
        assert!((member.longitude - 29.0).abs() < f64::EPSILON);
    }
}
