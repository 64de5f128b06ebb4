use std::sync::Arc;
use std::time::Duration;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{delay_and_then, json_encoded, status_code};
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;

use registry_report::{
    AppConfig, Coordinates, GeocodeProvider, GeocodeStatus, GeocodingResolver, GoogleGeocoder,
    NominatimGeocoder, ProviderOutcome,
};

const ADDRESS: &str = "Rua A, 12, Centro, Iguaba Grande, RJ, 28970-000";
const TIMEOUT: Duration = Duration::from_secs(5);

fn google(server: &Server, key: Option<&str>) -> GoogleGeocoder {
    GoogleGeocoder::new(
        key.map(|k| SecretString::new(k.into())),
        &server.url_str("/maps/api/geocode/json"),
        "br",
    )
    .unwrap()
}

fn nominatim(server: &Server) -> NominatimGeocoder {
    NominatimGeocoder::new(&server.url_str("/"), "registry-report-tests/1.0", "br").unwrap()
}

#[tokio::test]
async fn google_ok_resolves_the_full_address() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/maps/api/geocode/json"),
            request::query(url_decoded(contains(("address", ADDRESS)))),
            request::query(url_decoded(contains(("key", "test-key")))),
            request::query(url_decoded(contains(("region", "br")))),
        ))
        .respond_with(json_encoded(json!({
            "status": "OK",
            "results": [{ "geometry": { "location": { "lat": -22.8406, "lng": -42.2275 } } }]
        }))),
    );

    let config = AppConfig {
        min_interval_ms: 0,
        ..AppConfig::default()
    };
    let resolver = GeocodingResolver::new(Arc::new(google(&server, Some("test-key"))), &config);
    let result = resolver.resolve(ADDRESS, Some("Iguaba Grande, RJ")).await;

    assert_eq!(result.status(), GeocodeStatus::MatchedFull);
    assert_eq!(
        result.coordinates(),
        Some(Coordinates::new(-22.8406, -42.2275))
    );
    assert!(!result.is_jittered());
}

#[tokio::test]
async fn google_statuses_map_to_outcomes() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::query(url_decoded(contains(("address", "sem resultado")))))
            .respond_with(json_encoded(json!({ "status": "ZERO_RESULTS", "results": [] }))),
    );
    server.expect(
        Expectation::matching(request::query(url_decoded(contains(("address", "cota")))))
            .respond_with(json_encoded(json!({
                "status": "OVER_QUERY_LIMIT",
                "error_message": "You have exceeded your rate-limit"
            }))),
    );
    server.expect(
        Expectation::matching(request::query(url_decoded(contains(("address", "negado")))))
            .respond_with(json_encoded(json!({
                "status": "REQUEST_DENIED",
                "error_message": "The provided API key is invalid."
            }))),
    );

    let provider = google(&server, Some("test-key"));
    assert_eq!(
        provider.resolve("sem resultado", TIMEOUT).await,
        ProviderOutcome::NotFound
    );
    match provider.resolve("cota", TIMEOUT).await {
        ProviderOutcome::Unavailable(message) => assert!(message.starts_with("OVER_QUERY_LIMIT")),
        other => panic!("unexpected outcome {other:?}"),
    }
    match provider.resolve("negado", TIMEOUT).await {
        ProviderOutcome::Failed(message) => {
            assert_eq!(message, "REQUEST_DENIED: The provided API key is invalid.")
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn google_without_key_never_calls_out() {
    let server = Server::run();
    let provider = google(&server, None);
    assert!(!provider.has_credentials());

    let resolver = GeocodingResolver::new(Arc::new(provider), &AppConfig::default());
    let result = resolver.resolve(ADDRESS, None).await;
    assert_eq!(result.status(), GeocodeStatus::FailedNoCredentials);
    assert!(result.coordinates().is_none());
}

#[tokio::test]
async fn nominatim_sends_client_label_and_parses_string_coordinates() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/search"),
            request::headers(contains(("user-agent", "registry-report-tests/1.0"))),
            request::query(url_decoded(contains(("q", ADDRESS)))),
            request::query(url_decoded(contains(("format", "jsonv2")))),
            request::query(url_decoded(contains(("countrycodes", "br")))),
        ))
        .respond_with(json_encoded(json!([
            { "lat": "-22.8406", "lon": "-42.2275", "display_name": "Rua A" }
        ]))),
    );

    let outcome = nominatim(&server).resolve(ADDRESS, TIMEOUT).await;
    assert_eq!(
        outcome,
        ProviderOutcome::Found(Coordinates::new(-22.8406, -42.2275))
    );
}

#[tokio::test]
async fn nominatim_empty_and_overloaded_responses() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::query(url_decoded(contains(("q", "lugar nenhum")))))
            .respond_with(json_encoded(json!([]))),
    );
    server.expect(
        Expectation::matching(request::query(url_decoded(contains(("q", "ocupado")))))
            .respond_with(status_code(503)),
    );
    server.expect(
        Expectation::matching(request::query(url_decoded(contains(("q", "limite")))))
            .respond_with(status_code(429)),
    );

    let provider = nominatim(&server);
    assert_eq!(
        provider.resolve("lugar nenhum", TIMEOUT).await,
        ProviderOutcome::NotFound
    );
    assert!(matches!(
        provider.resolve("ocupado", TIMEOUT).await,
        ProviderOutcome::Unavailable(_)
    ));
    assert!(matches!(
        provider.resolve("limite", TIMEOUT).await,
        ProviderOutcome::Unavailable(_)
    ));
}

#[tokio::test]
async fn nominatim_non_finite_coordinates_are_rejected() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::path("/search"))
            .respond_with(json_encoded(json!([{ "lat": "NaN", "lon": "inf" }]))),
    );

    match nominatim(&server).resolve(ADDRESS, TIMEOUT).await {
        ProviderOutcome::Failed(message) => assert!(message.starts_with("invalid coordinates")),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn slow_provider_times_out() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::path("/search")).respond_with(delay_and_then(
            Duration::from_millis(500),
            json_encoded(json!([])),
        )),
    );

    let outcome = nominatim(&server)
        .resolve(ADDRESS, Duration::from_millis(50))
        .await;
    assert_eq!(outcome, ProviderOutcome::TimedOut);
}
