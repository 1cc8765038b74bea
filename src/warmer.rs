//! Cache Warmer
//!
//! Bulk-populates the popularity ranking, the geo index, the category list
//! and the per-city top lists from the backing data source. Each step runs
//! on its own: a failing step is logged and reported, and the rest proceed.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache_service::CacheService;
use crate::config::WarmupConfig;
use crate::keys;
use crate::places::{PlaceCache, PlaceLocation, PopularPlace};

/// Read access to the authoritative catalog, as needed for warm-up.
#[async_trait]
pub trait WarmupSource: Send + Sync {
    /// The `limit` highest-ranked places.
    async fn top_places(&self, limit: usize) -> Result<Vec<PopularPlace>>;

    /// Coordinates of every active place.
    async fn place_locations(&self) -> Result<Vec<PlaceLocation>>;

    /// All active categories, in the shape the read path caches them.
    async fn active_categories(&self) -> Result<serde_json::Value>;

    /// First page of a city's top places.
    async fn top_places_by_city(&self, city: &str, limit: u32) -> Result<serde_json::Value>;
}

/// One independently warmed part of the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WarmupStep {
    PopularPlaces,
    PlaceLocations,
    Categories,
    City(String),
}

impl fmt::Display for WarmupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PopularPlaces => f.write_str("popular places"),
            Self::PlaceLocations => f.write_str("place locations"),
            Self::Categories => f.write_str("categories"),
            Self::City(city) => write!(f, "city top list ({city})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmupFailure {
    pub step: WarmupStep,
    pub error: String,
}

/// What a warm-up pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    pub warmed: Vec<WarmupStep>,
    pub failed: Vec<WarmupFailure>,
}

impl WarmupReport {
    /// `true` when every step succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, step: WarmupStep, outcome: Result<()>) {
        match outcome {
            Ok(()) => self.warmed.push(step),
            Err(e) => {
                warn!(step = %step, error = %e, "Cache warm-up step failed");
                self.failed.push(WarmupFailure {
                    step,
                    error: format!("{e:#}"),
                });
            }
        }
    }
}

pub struct CacheWarmer {
    cache: Arc<CacheService>,
    places: PlaceCache,
    config: WarmupConfig,
}

impl CacheWarmer {
    #[must_use]
    pub fn new(cache: Arc<CacheService>, config: WarmupConfig) -> Self {
        let places = PlaceCache::new(Arc::clone(&cache));
        Self { cache, places, config }
    }

    /// Run one warm-up pass against `source`.
    pub async fn warm_up(&self, source: &dyn WarmupSource) -> WarmupReport {
        info!("Starting cache warm-up");
        let mut report = WarmupReport::default();

        report.record(WarmupStep::PopularPlaces, self.warm_popular_places(source).await);
        report.record(WarmupStep::PlaceLocations, self.warm_place_locations(source).await);
        report.record(WarmupStep::Categories, self.warm_categories(source).await);
        for city in &self.config.cities {
            let outcome = self.warm_city(source, city).await;
            report.record(WarmupStep::City(city.clone()), outcome);
        }

        info!(
            warmed = report.warmed.len(),
            failed = report.failed.len(),
            "Cache warm-up finished"
        );
        report
    }

    async fn warm_popular_places(&self, source: &dyn WarmupSource) -> Result<()> {
        let top = source.top_places(self.config.top_places_limit).await?;
        self.places.cache_popular_places(&top).await
    }

    async fn warm_place_locations(&self, source: &dyn WarmupSource) -> Result<()> {
        let locations = source.place_locations().await?;
        self.places.cache_place_locations(&locations).await?;
        Ok(())
    }

    async fn warm_categories(&self, source: &dyn WarmupSource) -> Result<()> {
        let categories = source.active_categories().await?;
        let key = keys::categories_all();
        self.cache.set(key.as_str(), &categories, key.ttl()).await
    }

    async fn warm_city(&self, source: &dyn WarmupSource, city: &str) -> Result<()> {
        let limit = self.config.city_top_limit;
        let places = source.top_places_by_city(city, limit).await?;
        let key = keys::place_list_by_city(city, 1, limit);
        self.cache.set(key.as_str(), &places, key.ttl()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_records_failures_with_context() {
        let mut report = WarmupReport::default();
        report.record(WarmupStep::Categories, Ok(()));
        report.record(
            WarmupStep::City("Ankara".into()),
            Err(anyhow::anyhow!("timeout").context("query failed")),
        );

        assert!(!report.is_complete());
        assert_eq!(report.warmed, vec![WarmupStep::Categories]);
        assert_eq!(report.failed[0].step.to_string(), "city top list (Ankara)");
        assert_eq!(report.failed[0].error, "query failed: timeout");
    }
}
