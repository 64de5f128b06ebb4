use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude.abs() <= 90.0
            && self.longitude.abs() <= 180.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeocodeStatus {
    MatchedFull,
    MatchedWithoutNumber,
    MatchedStreetAndPostalCode,
    MatchedLocalityFallback,
    FailedNoResult,
    FailedTimeout,
    FailedUnavailable,
    FailedProviderError,
    FailedNoCredentials,
}

impl GeocodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeocodeStatus::MatchedFull => "matched-full",
            GeocodeStatus::MatchedWithoutNumber => "matched-without-number",
            GeocodeStatus::MatchedStreetAndPostalCode => "matched-street-and-postal-code",
            GeocodeStatus::MatchedLocalityFallback => "matched-locality-fallback",
            GeocodeStatus::FailedNoResult => "failed-no-result",
            GeocodeStatus::FailedTimeout => "failed-timeout",
            GeocodeStatus::FailedUnavailable => "failed-unavailable",
            GeocodeStatus::FailedProviderError => "failed-provider-error",
            GeocodeStatus::FailedNoCredentials => "failed-no-credentials",
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(
            self,
            GeocodeStatus::MatchedFull
                | GeocodeStatus::MatchedWithoutNumber
                | GeocodeStatus::MatchedStreetAndPostalCode
                | GeocodeStatus::MatchedLocalityFallback
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            GeocodeStatus::MatchedFull => "Endereço completo",
            GeocodeStatus::MatchedWithoutNumber => "Rua sem número",
            GeocodeStatus::MatchedStreetAndPostalCode => "Rua e CEP",
            GeocodeStatus::MatchedLocalityFallback => "Centro do município (aproximado)",
            GeocodeStatus::FailedNoResult => "Sem resultado",
            GeocodeStatus::FailedTimeout => "Tempo esgotado",
            GeocodeStatus::FailedUnavailable => "Serviço indisponível",
            GeocodeStatus::FailedProviderError => "Erro do provedor",
            GeocodeStatus::FailedNoCredentials => "Credenciais ausentes",
        }
    }
}

impl fmt::Display for GeocodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving one address. Coordinates exist exactly when the
/// status is a `matched-*` label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeResult {
    coordinates: Option<Coordinates>,
    status: GeocodeStatus,
    detail: Option<String>,
    jittered: bool,
}

impl GeocodeResult {
    fn matched(tier: LadderTier, coordinates: Coordinates, jittered: bool) -> Self {
        Self {
            coordinates: Some(coordinates),
            status: tier.success_status(),
            detail: None,
            jittered,
        }
    }

    fn failed(status: GeocodeStatus, detail: impl Into<String>) -> Self {
        debug_assert!(!status.is_match());
        Self {
            coordinates: None,
            status,
            detail: Some(detail.into()),
            jittered: false,
        }
    }

    pub fn status(&self) -> GeocodeStatus {
        self.status
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        self.coordinates
    }

    pub fn latitude(&self) -> Option<f64> {
        self.coordinates.map(|c| c.latitude)
    }

    pub fn longitude(&self) -> Option<f64> {
        self.coordinates.map(|c| c.longitude)
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn is_jittered(&self) -> bool {
        self.jittered
    }

    pub fn is_resolved(&self) -> bool {
        self.coordinates.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOutcome {
    Found(Coordinates),
    NotFound,
    TimedOut,
    Unavailable(String),
    Failed(String),
}

impl ProviderOutcome {
    fn label(&self) -> &'static str {
        match self {
            ProviderOutcome::Found(_) => "found",
            ProviderOutcome::NotFound => "no-result",
            ProviderOutcome::TimedOut => "timeout",
            ProviderOutcome::Unavailable(_) => "unavailable",
            ProviderOutcome::Failed(_) => "error",
        }
    }

    fn failure_status(&self) -> GeocodeStatus {
        match self {
            ProviderOutcome::Found(_) | ProviderOutcome::NotFound => GeocodeStatus::FailedNoResult,
            ProviderOutcome::TimedOut => GeocodeStatus::FailedTimeout,
            ProviderOutcome::Unavailable(_) => GeocodeStatus::FailedUnavailable,
            ProviderOutcome::Failed(_) => GeocodeStatus::FailedProviderError,
        }
    }
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn has_credentials(&self) -> bool {
        true
    }

    /// Waits until the binding may issue another call. Not counted against
    /// the per-call timeout.
    async fn ready(&self) {}

    async fn resolve(&self, query: &str, timeout: Duration) -> ProviderOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderTier {
    Full,
    WithoutNumber,
    StreetAndPostalCode,
    Locality,
}

impl LadderTier {
    pub const ORDER: [LadderTier; 4] = [
        LadderTier::Full,
        LadderTier::WithoutNumber,
        LadderTier::StreetAndPostalCode,
        LadderTier::Locality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LadderTier::Full => "full",
            LadderTier::WithoutNumber => "without-number",
            LadderTier::StreetAndPostalCode => "street-and-postal-code",
            LadderTier::Locality => "locality",
        }
    }

    pub fn success_status(&self) -> GeocodeStatus {
        match self {
            LadderTier::Full => GeocodeStatus::MatchedFull,
            LadderTier::WithoutNumber => GeocodeStatus::MatchedWithoutNumber,
            LadderTier::StreetAndPostalCode => GeocodeStatus::MatchedStreetAndPostalCode,
            LadderTier::Locality => GeocodeStatus::MatchedLocalityFallback,
        }
    }

    pub fn query(&self, address: &str, locality: Option<&str>) -> Option<String> {
        let query = match self {
            LadderTier::Full => address.trim().to_string(),
            LadderTier::WithoutNumber => tokens(address)
                .filter(|token| !is_numeric_token(token))
                .collect::<Vec<_>>()
                .join(", "),
            LadderTier::StreetAndPostalCode => {
                let postal: Vec<&str> = tokens(address).filter(|t| is_postal_code(t)).collect();
                if postal.is_empty() {
                    return None;
                }
                let street = tokens(address)
                    .find(|token| !is_numeric_token(token) && !is_postal_code(token))?;
                std::iter::once(street)
                    .chain(postal)
                    .collect::<Vec<_>>()
                    .join(", ")
            }
            LadderTier::Locality => locality?.trim().to_string(),
        };
        Some(query).filter(|q| !q.is_empty())
    }
}

pub fn build_ladder(address: &str, locality: Option<&str>) -> Vec<(LadderTier, String)> {
    let mut ladder: Vec<(LadderTier, String)> = Vec::with_capacity(LadderTier::ORDER.len());
    for tier in LadderTier::ORDER {
        let Some(query) = tier.query(address, locality) else {
            continue;
        };
        if ladder.iter().any(|(_, seen)| seen.eq_ignore_ascii_case(&query)) {
            continue;
        }
        ladder.push((tier, query));
    }
    ladder
}

fn tokens(address: &str) -> impl Iterator<Item = &str> {
    address
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn is_numeric_token(token: &str) -> bool {
    !is_postal_code(token)
        && token.chars().any(|c| c.is_ascii_digit())
        && token.chars().all(|c| c.is_ascii_digit() || matches!(c, '-' | '/' | '.'))
}

fn is_postal_code(token: &str) -> bool {
    let digits: String = token.chars().filter(|c| c.is_ascii_digit()).collect();
    let shape_ok = token
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '-' | '.'));
    shape_ok && digits.len() == 8
}

#[derive(Clone)]
pub struct GeocodingResolver {
    provider: Arc<dyn GeocodeProvider>,
    timeout: Duration,
    jitter_degrees: f64,
    jitter_rng: Arc<Mutex<StdRng>>,
}

impl GeocodingResolver {
    pub fn new(provider: Arc<dyn GeocodeProvider>, config: &AppConfig) -> Self {
        Self {
            provider,
            timeout: config.timeout(),
            jitter_degrees: config.jitter_degrees,
            jitter_rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    pub fn with_rng(
        provider: Arc<dyn GeocodeProvider>,
        timeout: Duration,
        jitter_degrees: f64,
        rng: StdRng,
    ) -> Self {
        Self {
            provider,
            timeout,
            jitter_degrees,
            jitter_rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub async fn resolve(&self, address: &str, locality: Option<&str>) -> GeocodeResult {
        if !self.provider.has_credentials() {
            return GeocodeResult::failed(
                GeocodeStatus::FailedNoCredentials,
                format!("{} provider is not configured", self.provider.name()),
            );
        }
        if address.trim().is_empty() {
            return GeocodeResult::failed(GeocodeStatus::FailedNoResult, "empty address");
        }

        let mut attempts: Vec<(LadderTier, ProviderOutcome)> = Vec::new();
        for (tier, query) in build_ladder(address, locality) {
            let outcome = match self.attempt(&query).await {
                ProviderOutcome::Found(coordinates) if !coordinates.is_valid() => {
                    ProviderOutcome::Failed(format!(
                        "invalid coordinates {}, {}",
                        coordinates.latitude, coordinates.longitude
                    ))
                }
                outcome => outcome,
            };
            debug!(
                target: "geocoding",
                provider = self.provider.name(),
                tier = tier.as_str(),
                query = %query,
                outcome = outcome.label(),
                "geocoding attempt finished"
            );
            if let ProviderOutcome::Found(coordinates) = outcome {
                return if tier == LadderTier::Locality {
                    GeocodeResult::matched(tier, self.jitter(coordinates), self.jitter_degrees > 0.0)
                } else {
                    GeocodeResult::matched(tier, coordinates, false)
                };
            }
            attempts.push((tier, outcome));
        }

        exhausted(address, &attempts)
    }

    async fn attempt(&self, query: &str) -> ProviderOutcome {
        self.provider.ready().await;
        let call = AssertUnwindSafe(self.provider.resolve(query, self.timeout)).catch_unwind();
        // Grace period on top of the provider's own timeout.
        match timeout(self.timeout + Duration::from_millis(250), call).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(target: "geocoding", provider = self.provider.name(), %message, "provider panicked");
                ProviderOutcome::Failed(format!("provider panicked: {message}"))
            }
            Err(_) => ProviderOutcome::TimedOut,
        }
    }

    fn jitter(&self, coordinates: Coordinates) -> Coordinates {
        let spread = self.jitter_degrees;
        if spread <= 0.0 {
            return coordinates;
        }
        let mut rng = self.jitter_rng.lock();
        let (d_lat, d_lng) = loop {
            let d_lat = rng.gen_range(-spread..=spread);
            let d_lng = rng.gen_range(-spread..=spread);
            if d_lat != 0.0 || d_lng != 0.0 {
                break (d_lat, d_lng);
            }
        };
        Coordinates {
            latitude: (coordinates.latitude + d_lat).clamp(-90.0, 90.0),
            longitude: coordinates.longitude + d_lng,
        }
    }
}

fn exhausted(address: &str, attempts: &[(LadderTier, ProviderOutcome)]) -> GeocodeResult {
    let status = attempts
        .iter()
        .map(|(_, outcome)| outcome.failure_status())
        .max_by_key(failure_rank)
        .unwrap_or(GeocodeStatus::FailedNoResult);

    let summary = attempts
        .iter()
        .map(|(tier, outcome)| match outcome {
            ProviderOutcome::Unavailable(message) | ProviderOutcome::Failed(message) => {
                format!("{}={} ({message})", tier.as_str(), outcome.label())
            }
            _ => format!("{}={}", tier.as_str(), outcome.label()),
        })
        .collect::<Vec<_>>()
        .join(", ");

    GeocodeResult::failed(status, format!("no match for \"{address}\": {summary}"))
}

fn failure_rank(status: &GeocodeStatus) -> u8 {
    match status {
        GeocodeStatus::FailedProviderError => 4,
        GeocodeStatus::FailedUnavailable => 3,
        GeocodeStatus::FailedTimeout => 2,
        GeocodeStatus::FailedNoResult => 1,
        _ => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    address: String,
    locality: Option<String>,
}

/// Session memo of resolutions keyed by canonical address. Unbounded; drop it
/// to start over. Concurrent misses for the same key may both reach the
/// provider.
#[derive(Clone, Default)]
pub struct GeocodeCache {
    entries: Arc<Mutex<HashMap<CacheKey, GeocodeResult>>>,
}

impl GeocodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &str, locality: Option<&str>) -> Option<GeocodeResult> {
        let key = CacheKey {
            address: address.to_string(),
            locality: locality.map(str::to_string),
        };
        self.entries.lock().get(&key).cloned()
    }

    pub fn insert(&self, address: &str, locality: Option<&str>, result: &GeocodeResult) {
        if result.status() == GeocodeStatus::FailedNoCredentials {
            return;
        }
        let key = CacheKey {
            address: address.to_string(),
            locality: locality.map(str::to_string),
        };
        self.entries.lock().insert(key, result.clone());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

pub struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Paces every call to the wrapped provider through one shared limiter, so
/// the aggregate rate holds regardless of how many rows resolve concurrently.
pub struct RateLimitedProvider {
    inner: Arc<dyn GeocodeProvider>,
    limiter: RateLimiter,
    calls: AtomicUsize,
}

impl RateLimitedProvider {
    pub fn new(inner: Arc<dyn GeocodeProvider>, min_interval: Duration) -> Self {
        Self {
            inner,
            limiter: RateLimiter::new(min_interval),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeocodeProvider for RateLimitedProvider {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn has_credentials(&self) -> bool {
        self.inner.has_credentials()
    }

    async fn ready(&self) {
        self.inner.ready().await;
        self.limiter.wait().await;
    }

    async fn resolve(&self, query: &str, timeout: Duration) -> ProviderOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve(query, timeout).await
    }
}
