use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{AppConfig, ProviderKind};
use crate::errors::{AppError, AppResult};
use crate::geocoding::{Coordinates, GeocodeProvider, ProviderOutcome};

pub fn build_provider(config: &AppConfig) -> AppResult<Arc<dyn GeocodeProvider>> {
    let provider: Arc<dyn GeocodeProvider> = match config.provider {
        ProviderKind::Google => {
            if config.google_maps_api_key.is_none() {
                warn!(
                    target: "geocoding",
                    "GOOGLE_MAPS_API_KEY is not set; every address will be reported without credentials"
                );
            }
            Arc::new(GoogleGeocoder::new(
                config.google_maps_api_key.clone(),
                &config.google_geocode_url,
                &config.region,
            )?)
        }
        ProviderKind::Nominatim => Arc::new(NominatimGeocoder::new(
            &config.nominatim_base_url,
            &config.nominatim_user_agent,
            &config.region,
        )?),
    };
    info!(target: "geocoding", provider = provider.name(), "geocoding provider ready");
    Ok(provider)
}

pub struct GoogleGeocoder {
    http: Client,
    endpoint: Url,
    api_key: Option<SecretString>,
    region: String,
}

impl GoogleGeocoder {
    pub fn new(api_key: Option<SecretString>, endpoint: &str, region: &str) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("registry-report/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let endpoint = Url::parse(endpoint)
            .map_err(|err| AppError::Config(format!("invalid Google geocode URL: {err}")))?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            region: region.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct GoogleResponse {
    status: String,
    #[serde(default)]
    results: Vec<GoogleResult>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct GoogleResult {
    geometry: GoogleGeometry,
}

#[derive(Deserialize)]
struct GoogleGeometry {
    location: GoogleLocation,
}

#[derive(Deserialize)]
struct GoogleLocation {
    lat: f64,
    lng: f64,
}

#[async_trait]
impl GeocodeProvider for GoogleGeocoder {
    fn name(&self) -> &'static str {
        "google"
    }

    fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    async fn resolve(&self, query: &str, timeout: Duration) -> ProviderOutcome {
        let Some(key) = self.api_key.as_ref() else {
            return ProviderOutcome::Failed("missing Google Maps API key".into());
        };

        let request = self
            .http
            .get(self.endpoint.clone())
            .query(&[
                ("address", query),
                ("key", key.expose_secret()),
                ("region", self.region.as_str()),
                ("language", "pt-BR"),
            ])
            .timeout(timeout);

        let parsed: GoogleResponse = match fetch_json(request).await {
            Ok(parsed) => parsed,
            Err(outcome) => return outcome,
        };

        match parsed.status.as_str() {
            "OK" => parsed
                .results
                .into_iter()
                .next()
                .map(|result| {
                    let location = result.geometry.location;
                    found(Coordinates::new(location.lat, location.lng))
                })
                .unwrap_or(ProviderOutcome::NotFound),
            "ZERO_RESULTS" => ProviderOutcome::NotFound,
            "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" | "UNKNOWN_ERROR" => {
                ProviderOutcome::Unavailable(google_message(&parsed.status, parsed.error_message))
            }
            _ => ProviderOutcome::Failed(google_message(&parsed.status, parsed.error_message)),
        }
    }
}

fn google_message(status: &str, message: Option<String>) -> String {
    match message {
        Some(message) => format!("{status}: {message}"),
        None => status.to_string(),
    }
}

pub struct NominatimGeocoder {
    http: Client,
    search_url: Url,
    user_agent: String,
    region: String,
}

impl NominatimGeocoder {
    pub fn new(base_url: &str, user_agent: &str, region: &str) -> AppResult<Self> {
        let user_agent = user_agent.trim().to_string();
        let mut builder = Client::builder();
        if !user_agent.is_empty() {
            builder = builder.user_agent(user_agent.clone());
        }
        let http = builder.build()?;

        let mut search_url = Url::parse(base_url)
            .map_err(|err| AppError::Config(format!("invalid Nominatim base URL: {err}")))?;
        search_url
            .path_segments_mut()
            .map_err(|_| AppError::Config("invalid Nominatim base URL".into()))?
            .pop_if_empty()
            .push("search");

        Ok(Self {
            http,
            search_url,
            user_agent,
            region: region.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

#[async_trait]
impl GeocodeProvider for NominatimGeocoder {
    fn name(&self) -> &'static str {
        "nominatim"
    }

    fn has_credentials(&self) -> bool {
        !self.user_agent.is_empty()
    }

    async fn resolve(&self, query: &str, timeout: Duration) -> ProviderOutcome {
        let request = self
            .http
            .get(self.search_url.clone())
            .query(&[
                ("q", query),
                ("format", "jsonv2"),
                ("limit", "1"),
                ("countrycodes", self.region.as_str()),
            ])
            .timeout(timeout);

        let places: Vec<NominatimPlace> = match fetch_json(request).await {
            Ok(places) => places,
            Err(outcome) => return outcome,
        };

        let Some(place) = places.into_iter().next() else {
            return ProviderOutcome::NotFound;
        };
        match (place.lat.trim().parse::<f64>(), place.lon.trim().parse::<f64>()) {
            (Ok(latitude), Ok(longitude)) => found(Coordinates::new(latitude, longitude)),
            _ => ProviderOutcome::Failed(format!(
                "unparseable coordinates: {}, {}",
                place.lat, place.lon
            )),
        }
    }
}

fn found(coordinates: Coordinates) -> ProviderOutcome {
    if coordinates.is_valid() {
        ProviderOutcome::Found(coordinates)
    } else {
        ProviderOutcome::Failed(format!(
            "invalid coordinates {}, {}",
            coordinates.latitude, coordinates.longitude
        ))
    }
}

async fn fetch_json<T: serde::de::DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, ProviderOutcome> {
    let response = request.send().await.map_err(classify_transport)?;
    if let Some(outcome) = classify_status(response.status()) {
        return Err(outcome);
    }
    response.json::<T>().await.map_err(classify_transport)
}

fn classify_transport(err: reqwest::Error) -> ProviderOutcome {
    // Request URLs carry the API key.
    let err = err.without_url();
    if err.is_timeout() {
        ProviderOutcome::TimedOut
    } else if err.is_connect() {
        ProviderOutcome::Unavailable(err.to_string())
    } else {
        ProviderOutcome::Failed(err.to_string())
    }
}

fn classify_status(status: StatusCode) -> Option<ProviderOutcome> {
    if status.is_success() {
        None
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        Some(ProviderOutcome::TimedOut)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Some(ProviderOutcome::Unavailable(format!("HTTP {status}")))
    } else {
        Some(ProviderOutcome::Failed(format!("HTTP {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_statuses() {
        assert!(classify_status(StatusCode::OK).is_none());
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(ProviderOutcome::Unavailable(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            Some(ProviderOutcome::Unavailable(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            Some(ProviderOutcome::Failed(_))
        ));
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            Some(ProviderOutcome::TimedOut)
        );
    }

    #[test]
    fn rejects_unusable_coordinates() {
        assert_eq!(
            found(Coordinates::new(-22.84, -42.1)),
            ProviderOutcome::Found(Coordinates::new(-22.84, -42.1))
        );
        let unusable = [
            (f64::NAN, 1.0),
            (1.0, f64::INFINITY),
            (-91.0, 0.0),
            (0.0, 181.0),
        ];
        for (latitude, longitude) in unusable {
            assert!(matches!(
                found(Coordinates::new(latitude, longitude)),
                ProviderOutcome::Failed(message) if message.starts_with("invalid coordinates")
            ));
        }
    }

    #[test]
    fn google_without_key_lacks_credentials() {
        let geocoder = GoogleGeocoder::new(
            None,
            "https://maps.googleapis.com/maps/api/geocode/json",
            "br",
        )
        .unwrap();
        assert!(!geocoder.has_credentials());
    }

    #[test]
    fn nominatim_requires_client_label() {
        let anonymous = NominatimGeocoder::new("https://nominatim.example", " ", "br").unwrap();
        assert!(!anonymous.has_credentials());

        let labeled =
            NominatimGeocoder::new("https://nominatim.example/", "registry-report/test", "br")
                .unwrap();
        assert!(labeled.has_credentials());
        assert_eq!(labeled.search_url.as_str(), "https://nominatim.example/search");
    }

    #[test]
    fn rejects_invalid_endpoints() {
        assert!(GoogleGeocoder::new(None, "not a url", "br").is_err());
        assert!(matches!(
            build_provider(&AppConfig {
                nominatim_base_url: "::".into(),
                ..AppConfig::default()
            }),
            Err(AppError::Config(_))
        ));
    }
}
