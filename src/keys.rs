//! Key Space Registry
//!
//! Maps every logical cache category to its key layout and default TTL.
//! Everything here is pure: the same logical request always yields the same
//! key string. Structured parameters (list filters, search filters) are
//! canonicalized with object fields sorted by name and reduced to a
//! fixed-length SHA-256 prefix, so construction order never changes the key.

use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Number of digest bytes kept in a parameter hash (32 hex characters).
pub const PARAMS_HASH_BYTES: usize = 16;

pub const PLACE_DETAIL_PREFIX: &str = "place:detail:";
pub const PLACE_LIST_PREFIX: &str = "place:list:";
pub const PLACE_LIST_BY_CITY_PREFIX: &str = "place:list:city:";
pub const PLACE_LIST_BY_CATEGORY_PREFIX: &str = "place:list:cat:";
pub const TOP_PLACES_PREFIX: &str = "place:top:";
pub const PLACE_STATS_PREFIX: &str = "place:stats:";
pub const RECENT_PLACES_PREFIX: &str = "place:recent:";
pub const TRENDING_PLACES_PREFIX: &str = "place:trending:";
pub const CATEGORIES_ALL: &str = "categories:all";
pub const CATEGORIES_TREE: &str = "categories:tree";
pub const POPULAR_PLACES: &str = "place:popular";
pub const PLACE_LOCATIONS: &str = "places:locations";
pub const LOCK_PREFIX: &str = "lock:";

/// Logical cache categories, each with exactly one default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCategory {
    PlaceDetail,
    PlaceList,
    PlaceListByCity,
    PlaceListByCategory,
    TopPlaces,
    PlaceStats,
    Categories,
    SearchResults,
    UserFavorites,
    RecentPlaces,
    NearbyPlaces,
    TrendingPlaces,
    PlaceViewCount,
    RateLimit,
    PopularPlaces,
    PlaceLocations,
}

impl KeyCategory {
    /// Default expiry for entries of this category.
    #[must_use]
    pub const fn default_ttl(self) -> Duration {
        let secs = match self {
            Self::PlaceList | Self::UserFavorites | Self::TrendingPlaces => 300,
            Self::PlaceListByCity | Self::PlaceListByCategory | Self::RecentPlaces => 600,
            Self::TopPlaces | Self::NearbyPlaces => 900,
            Self::PlaceStats | Self::SearchResults => 1_800,
            Self::PlaceDetail | Self::PopularPlaces | Self::PlaceLocations => 3_600,
            Self::Categories => 86_400,
            Self::PlaceViewCount => 86_400 * 7,
            Self::RateLimit => 60,
        };
        Duration::from_secs(secs)
    }
}

/// A constructed cache key together with its category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: String,
    category: KeyCategory,
}

impl CacheKey {
    fn new(category: KeyCategory, key: String) -> Self {
        Self { key, category }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn category(&self) -> KeyCategory {
        self.category
    }

    /// Default TTL of the key's category.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.category.default_ttl()
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.key
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Hash structured parameters into a fixed-length, field-order independent token.
///
/// # Errors
///
/// Returns [`CacheError::Serialization`] if `params` cannot be represented as JSON
/// (for example a map with non-string keys).
pub fn params_hash<P: Serialize + ?Sized>(params: &P) -> Result<String, CacheError> {
    let value = serde_json::to_value(params)?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);

    let digest = Sha256::digest(canonical.as_bytes());
    let prefix = digest.get(..PARAMS_HASH_BYTES).unwrap_or(digest.as_slice());
    Ok(hex::encode(prefix))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[must_use]
pub fn place_detail(place_id: i64) -> CacheKey {
    CacheKey::new(KeyCategory::PlaceDetail, format!("{PLACE_DETAIL_PREFIX}{place_id}"))
}

/// Key for a filtered place list.
///
/// # Errors
///
/// Fails if the filter parameters cannot be serialized.
pub fn place_list<P: Serialize + ?Sized>(params: &P) -> Result<CacheKey, CacheError> {
    Ok(CacheKey::new(
        KeyCategory::PlaceList,
        format!("{PLACE_LIST_PREFIX}{}", params_hash(params)?),
    ))
}

#[must_use]
pub fn place_list_by_city(city: &str, page: u32, limit: u32) -> CacheKey {
    CacheKey::new(
        KeyCategory::PlaceListByCity,
        format!("{PLACE_LIST_BY_CITY_PREFIX}{city}:{page}:{limit}"),
    )
}

#[must_use]
pub fn place_list_by_category(category_id: i64, page: u32, limit: u32) -> CacheKey {
    CacheKey::new(
        KeyCategory::PlaceListByCategory,
        format!("{PLACE_LIST_BY_CATEGORY_PREFIX}{category_id}:{page}:{limit}"),
    )
}

#[must_use]
pub fn top_places(limit: u32) -> CacheKey {
    CacheKey::new(KeyCategory::TopPlaces, format!("{TOP_PLACES_PREFIX}{limit}"))
}

#[must_use]
pub fn place_stats(place_id: i64) -> CacheKey {
    CacheKey::new(KeyCategory::PlaceStats, format!("{PLACE_STATS_PREFIX}{place_id}"))
}

#[must_use]
pub fn categories_all() -> CacheKey {
    CacheKey::new(KeyCategory::Categories, CATEGORIES_ALL.to_string())
}

#[must_use]
pub fn categories_tree() -> CacheKey {
    CacheKey::new(KeyCategory::Categories, CATEGORIES_TREE.to_string())
}

/// Key for search results; the query is hashed together with the filters.
///
/// Object filters get the query merged in as a `query` field; any other
/// filter shape is nested under `filters`.
///
/// # Errors
///
/// Fails if the filters cannot be serialized.
pub fn search_results<F: Serialize + ?Sized>(query: &str, filters: &F) -> Result<CacheKey, CacheError> {
    let combined = match serde_json::to_value(filters)? {
        Value::Object(mut map) => {
            map.insert("query".to_string(), Value::String(query.to_string()));
            Value::Object(map)
        }
        Value::Null => serde_json::json!({ "query": query }),
        other => serde_json::json!({ "query": query, "filters": other }),
    };
    Ok(CacheKey::new(
        KeyCategory::SearchResults,
        format!("search:{}", params_hash(&combined)?),
    ))
}

#[must_use]
pub fn user_favorites(user_id: i64) -> CacheKey {
    CacheKey::new(KeyCategory::UserFavorites, format!("user:favorites:{user_id}"))
}

#[must_use]
pub fn recent_places(limit: u32) -> CacheKey {
    CacheKey::new(KeyCategory::RecentPlaces, format!("{RECENT_PLACES_PREFIX}{limit}"))
}

#[must_use]
pub fn nearby_places(latitude: f64, longitude: f64, radius_km: f64) -> CacheKey {
    CacheKey::new(
        KeyCategory::NearbyPlaces,
        format!("place:nearby:{latitude}:{longitude}:{radius_km}"),
    )
}

#[must_use]
pub fn trending_places(limit: u32) -> CacheKey {
    CacheKey::new(KeyCategory::TrendingPlaces, format!("{TRENDING_PLACES_PREFIX}{limit}"))
}

/// Per-day view counter key (`YYYY-MM-DD`).
#[must_use]
pub fn place_view_count(place_id: i64, day: NaiveDate) -> CacheKey {
    CacheKey::new(
        KeyCategory::PlaceViewCount,
        format!("place:views:{place_id}:{}", day.format("%Y-%m-%d")),
    )
}

#[must_use]
pub fn rate_limit(identifier: &str, endpoint: &str) -> CacheKey {
    CacheKey::new(KeyCategory::RateLimit, format!("ratelimit:{identifier}:{endpoint}"))
}

#[must_use]
pub fn popular_places() -> CacheKey {
    CacheKey::new(KeyCategory::PopularPlaces, POPULAR_PLACES.to_string())
}

#[must_use]
pub fn place_locations() -> CacheKey {
    CacheKey::new(KeyCategory::PlaceLocations, PLACE_LOCATIONS.to_string())
}

/// Ephemeral lock token key guarding stampede-protected population of `key`.
#[must_use]
pub fn lock_key(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}
