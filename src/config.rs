use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};

const DEFAULT_GOOGLE_GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const DEFAULT_NOMINATIM_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MIN_INTERVAL_MS: u64 = 1_000;
const DEFAULT_JITTER_DEGREES: f64 = 0.005;
const MAX_WORKERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Nominatim,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Nominatim => "nominatim",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(ProviderKind::Google),
            "nominatim" | "osm" => Ok(ProviderKind::Nominatim),
            _ => Err(AppError::Config(format!("unknown geocoding provider: {value}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub provider: ProviderKind,
    pub google_maps_api_key: Option<SecretString>,
    pub google_geocode_url: String,
    pub nominatim_base_url: String,
    pub nominatim_user_agent: String,
    pub region: String,
    pub timeout_ms: u64,
    pub min_interval_ms: u64,
    pub workers: usize,
    pub jitter_degrees: f64,
    pub default_locality: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub provider: ProviderKind,
    pub google_geocode_url: String,
    pub nominatim_base_url: String,
    pub nominatim_user_agent: String,
    pub region: String,
    pub timeout_ms: u64,
    pub min_interval_ms: u64,
    pub workers: usize,
    pub jitter_degrees: f64,
    pub default_locality: Option<String>,
    pub has_google_maps_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            provider: env::var("GEOCODER_PROVIDER")
                .ok()
                .and_then(|value| ProviderKind::parse(&value).ok())
                .unwrap_or(ProviderKind::Nominatim),
            google_maps_api_key: non_empty("GOOGLE_MAPS_API_KEY")
                .map(|value| SecretString::new(value.into())),
            google_geocode_url: non_empty("GOOGLE_GEOCODE_URL")
                .unwrap_or_else(|| DEFAULT_GOOGLE_GEOCODE_URL.to_string()),
            nominatim_base_url: non_empty("NOMINATIM_BASE_URL")
                .unwrap_or_else(|| DEFAULT_NOMINATIM_BASE_URL.to_string()),
            nominatim_user_agent: env::var("NOMINATIM_USER_AGENT")
                .unwrap_or_else(|_| default_user_agent()),
            region: non_empty("GEOCODER_REGION").unwrap_or_else(|| "br".to_string()),
            timeout_ms: parse_u64("GEOCODER_TIMEOUT_MS", DEFAULT_TIMEOUT_MS).max(1),
            min_interval_ms: parse_u64("GEOCODER_MIN_INTERVAL_MS", DEFAULT_MIN_INTERVAL_MS),
            workers: clamp_workers(parse_usize("GEOCODER_WORKERS", 1)),
            jitter_degrees: parse_f64("LOCALITY_JITTER_DEGREES", DEFAULT_JITTER_DEGREES).abs(),
            default_locality: non_empty("DEFAULT_LOCALITY"),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = clamp_workers(workers);
        self
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            provider: self.provider,
            google_geocode_url: self.google_geocode_url.clone(),
            nominatim_base_url: self.nominatim_base_url.clone(),
            nominatim_user_agent: self.nominatim_user_agent.clone(),
            region: self.region.clone(),
            timeout_ms: self.timeout_ms,
            min_interval_ms: self.min_interval_ms,
            workers: self.workers,
            jitter_degrees: self.jitter_degrees,
            default_locality: self.default_locality.clone(),
            has_google_maps_key: self.google_maps_api_key.is_some(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Nominatim,
            google_maps_api_key: None,
            google_geocode_url: DEFAULT_GOOGLE_GEOCODE_URL.to_string(),
            nominatim_base_url: DEFAULT_NOMINATIM_BASE_URL.to_string(),
            nominatim_user_agent: default_user_agent(),
            region: "br".to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            workers: 1,
            jitter_degrees: DEFAULT_JITTER_DEGREES,
            default_locality: None,
        }
    }
}

fn default_user_agent() -> String {
    format!("registry-report/{}", env!("CARGO_PKG_VERSION"))
}

fn clamp_workers(value: usize) -> usize {
    value.clamp(1, MAX_WORKERS)
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}
