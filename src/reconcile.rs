use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::dataset::Dataset;
use crate::errors::AppResult;
use crate::filters::FilteredView;
use crate::geocoding::{
    GeocodeCache, GeocodeProvider, GeocodeResult, GeocodeStatus, GeocodingResolver,
    RateLimitedProvider,
};

pub const NOT_ATTEMPTED: &str = "not-attempted";

#[derive(Debug, Clone, Serialize)]
pub struct GeocodeProgress {
    pub total_rows: usize,
    pub processed: usize,
    pub resolved: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GeocodeRunStats {
    pub total_rows: usize,
    pub attempted: usize,
    pub cache_hits: usize,
    pub provider_calls: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub not_attempted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowGeocode {
    pub row: usize,
    pub address: String,
    pub locality: Option<String>,
    pub result: Option<GeocodeResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedAddress {
    pub row: usize,
    pub address: String,
    pub status: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MapMarker {
    pub row: usize,
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub status: GeocodeStatus,
    pub status_label: String,
    pub approximate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeocodeRun {
    pub rows: Vec<RowGeocode>,
    pub stats: GeocodeRunStats,
}

impl GeocodeRun {
    pub fn result_for(&self, row: usize) -> Option<&GeocodeResult> {
        self.rows
            .iter()
            .find(|entry| entry.row == row)
            .and_then(|entry| entry.result.as_ref())
    }

    pub fn unresolved(&self) -> Vec<UnresolvedAddress> {
        self.rows
            .iter()
            .filter(|entry| !entry.result.as_ref().is_some_and(GeocodeResult::is_resolved))
            .map(|entry| UnresolvedAddress {
                row: entry.row,
                address: entry.address.clone(),
                status: entry
                    .result
                    .as_ref()
                    .map(|r| r.status().as_str().to_string())
                    .unwrap_or_else(|| NOT_ATTEMPTED.to_string()),
                detail: entry.result.as_ref().and_then(|r| r.detail().map(str::to_string)),
            })
            .collect()
    }

    pub fn markers(&self, dataset: &Dataset) -> Vec<MapMarker> {
        self.rows
            .iter()
            .filter_map(|entry| {
                let result = entry.result.as_ref()?;
                let coordinates = result.coordinates()?;
                Some(MapMarker {
                    row: entry.row,
                    name: dataset.display_name(entry.row),
                    address: entry.address.clone(),
                    latitude: coordinates.latitude,
                    longitude: coordinates.longitude,
                    status: result.status(),
                    status_label: result.status().description().to_string(),
                    approximate: result.status() == GeocodeStatus::MatchedLocalityFallback,
                })
            })
            .collect()
    }
}

pub struct GeocodeSession {
    resolver: GeocodingResolver,
    paced: Arc<RateLimitedProvider>,
    cache: GeocodeCache,
    workers: usize,
    default_locality: Option<String>,
}

impl GeocodeSession {
    pub fn new(provider: Arc<dyn GeocodeProvider>, config: &AppConfig) -> Self {
        Self::build(provider, config, StdRng::from_entropy())
    }

    pub fn with_seed(provider: Arc<dyn GeocodeProvider>, config: &AppConfig, seed: u64) -> Self {
        Self::build(provider, config, StdRng::seed_from_u64(seed))
    }

    fn build(provider: Arc<dyn GeocodeProvider>, config: &AppConfig, rng: StdRng) -> Self {
        let paced = Arc::new(RateLimitedProvider::new(provider, config.min_interval()));
        let resolver = GeocodingResolver::with_rng(
            paced.clone(),
            config.timeout(),
            config.jitter_degrees,
            rng,
        );
        Self {
            resolver,
            paced,
            cache: GeocodeCache::new(),
            workers: config.workers.max(1),
            default_locality: config.default_locality.clone(),
        }
    }

    pub fn cache(&self) -> &GeocodeCache {
        &self.cache
    }

    pub fn provider_calls(&self) -> usize {
        self.paced.calls()
    }

    /// Resolves every row of `view`. Rows never reached before `cancel_flag`
    /// is raised keep no result.
    pub async fn geocode_view(
        &self,
        view: &FilteredView<'_>,
        observer: Option<Arc<dyn Fn(GeocodeProgress) + Send + Sync>>,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<GeocodeRun> {
        let dataset = view.dataset();
        dataset.validate_address_columns()?;

        let mut rows: Vec<RowGeocode> = view
            .rows()
            .iter()
            .map(|row| {
                let address = dataset.address(*row);
                RowGeocode {
                    row: *row,
                    address: address.format(),
                    locality: address
                        .locality_hint()
                        .or_else(|| self.default_locality.clone()),
                    result: None,
                }
            })
            .collect();

        let total_rows = rows.len();
        let calls_before = self.paced.calls();
        info!(
            target: "geocoding",
            provider = self.resolver.provider_name(),
            rows = total_rows,
            workers = self.workers,
            "starting geocoding run"
        );

        let jobs: Vec<(usize, String, Option<String>)> = rows
            .iter()
            .enumerate()
            .map(|(slot, entry)| (slot, entry.address.clone(), entry.locality.clone()))
            .collect();

        let mut results = stream::iter(jobs)
            .map(|(slot, address, locality)| {
                let cancel_flag = cancel_flag.clone();
                async move {
                    if cancel_flag
                        .as_ref()
                        .is_some_and(|flag| flag.load(Ordering::SeqCst))
                    {
                        return (slot, None);
                    }
                    let outcome = self.resolve_cached(&address, locality.as_deref()).await;
                    (slot, Some(outcome))
                }
            })
            .buffer_unordered(self.workers);

        let mut stats = GeocodeRunStats {
            total_rows,
            ..GeocodeRunStats::default()
        };
        let mut processed = 0;
        while let Some((slot, outcome)) = results.next().await {
            let Some((result, cache_hit)) = outcome else {
                continue;
            };
            if cache_hit {
                stats.cache_hits += 1;
            }
            if result.is_resolved() {
                stats.resolved += 1;
            } else {
                stats.unresolved += 1;
            }
            stats.attempted += 1;
            rows[slot].result = Some(result);

            processed += 1;
            if let Some(callback) = &observer {
                callback(GeocodeProgress {
                    total_rows,
                    processed,
                    resolved: stats.resolved,
                });
            }
        }

        stats.not_attempted = total_rows - stats.attempted;
        stats.provider_calls = self.paced.calls().saturating_sub(calls_before);
        if stats.not_attempted > 0 {
            warn!(
                target: "geocoding",
                not_attempted = stats.not_attempted,
                "geocoding run cancelled before every row was attempted"
            );
        }
        info!(
            target: "geocoding",
            resolved = stats.resolved,
            unresolved = stats.unresolved,
            cache_hits = stats.cache_hits,
            provider_calls = stats.provider_calls,
            cached_addresses = self.cache.len(),
            "geocoding run finished"
        );

        Ok(GeocodeRun { rows, stats })
    }

    async fn resolve_cached(&self, address: &str, locality: Option<&str>) -> (GeocodeResult, bool) {
        if let Some(hit) = self.cache.get(address, locality) {
            return (hit, true);
        }
        let result = self.resolver.resolve(address, locality).await;
        self.cache.insert(address, locality, &result);
        (result, false)
    }
}
