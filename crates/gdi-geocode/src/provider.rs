use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use gdi_core::{BoundingBox, GeocodeQuery, GeocodeResult, Provenance};
use gdi_storage::{
    classify_reqwest_error, classify_status_code, FetchError, HttpClientConfig, HttpFetcher, RetryDisposition,
};
use serde::Deserialize;
use thiserror::Error;

pub const GOOGLE_GEOCODE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoding request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("geocoding response was not valid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("geocoding api returned {status}: {message}")]
    Api { status: String, message: String },
    #[error("{0}")]
    Provider(String),
    #[error("geocoding backend unavailable: {0}")]
    Unavailable(String),
}

impl GeocodeError {
    /// Failures worth another gated attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            GeocodeError::Fetch(FetchError::HttpStatus { status, .. }) => {
                classify_status_code(*status) == RetryDisposition::Retryable
            }
            GeocodeError::Fetch(FetchError::Request(err)) => {
                classify_reqwest_error(err) == RetryDisposition::Retryable
            }
            GeocodeError::Api { status, .. } => status == "OVER_QUERY_LIMIT" || status == "UNKNOWN_ERROR",
            GeocodeError::Unavailable(_) => true,
            GeocodeError::Fetch(FetchError::Closed) | GeocodeError::Decode(_) | GeocodeError::Provider(_) => false,
        }
    }
}

/// A live geocoding backend. Only the cache service calls this, and only
/// after the rate gate has admitted the call.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means the backend answered but found nothing.
    async fn lookup(&self, query: &GeocodeQuery) -> Result<Option<GeocodeResult>, GeocodeError>;
}

#[derive(Debug, Clone)]
pub struct GoogleGeocoderConfig {
    pub api_key: String,
    pub endpoint: String,
    pub region: String,
    pub language: String,
    pub http: HttpClientConfig,
}

impl GoogleGeocoderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: GOOGLE_GEOCODE_ENDPOINT.to_string(),
            region: "au".to_string(),
            language: "en".to_string(),
            http: HttpClientConfig::default(),
        }
    }
}

pub struct GoogleGeocoder {
    fetcher: HttpFetcher,
    config: GoogleGeocoderConfig,
}

impl GoogleGeocoder {
    /// One lookup is exactly one HTTP request. Retries belong to the cache
    /// service, which sends each attempt back through the rate gate.
    pub fn new(mut config: GoogleGeocoderConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.api_key.trim().is_empty(), "google maps api key is empty");
        config.http.backoff.max_retries = 0;
        let fetcher = HttpFetcher::new(config.http.clone())?;
        Ok(Self { fetcher, config })
    }
}

#[async_trait]
impl GeocodeProvider for GoogleGeocoder {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn lookup(&self, query: &GeocodeQuery) -> Result<Option<GeocodeResult>, GeocodeError> {
        let params = [
            ("address", query.raw.trim()),
            ("key", self.config.api_key.as_str()),
            ("region", self.config.region.as_str()),
            ("language", self.config.language.as_str()),
        ];
        let response = self
            .fetcher
            .get_with_query("google_geocode", &self.config.endpoint, &params)
            .await?;
        parse_google_response(&response.body)
    }
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    results: Vec<GoogleResult>,
}

#[derive(Debug, Deserialize)]
struct GoogleResult {
    #[serde(default)]
    formatted_address: String,
    #[serde(default)]
    place_id: String,
    geometry: GoogleGeometry,
    #[serde(default)]
    address_components: Vec<AddressComponent>,
}

#[derive(Debug, Deserialize)]
struct GoogleGeometry {
    location: LatLng,
    #[serde(default)]
    viewport: Option<Viewport>,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct Viewport {
    northeast: LatLng,
    southwest: LatLng,
}

#[derive(Debug, Deserialize)]
struct AddressComponent {
    long_name: String,
    #[serde(default)]
    types: Vec<String>,
}

/// Decode a Geocoding API body, keeping only the first result.
pub fn parse_google_response(body: &[u8]) -> Result<Option<GeocodeResult>, GeocodeError> {
    let response: GoogleResponse = serde_json::from_slice(body)?;
    match response.status.as_str() {
        "OK" => {}
        "ZERO_RESULTS" => return Ok(None),
        _ => {
            return Err(GeocodeError::Api {
                message: response
                    .error_message
                    .unwrap_or_else(|| response.status.clone()),
                status: response.status,
            })
        }
    }

    let Some(first) = response.results.into_iter().next() else {
        return Ok(None);
    };
    let postcode = first
        .address_components
        .iter()
        .find(|c| c.types.iter().any(|t| t == "postal_code"))
        .map(|c| c.long_name.clone());
    let bbox = first.geometry.viewport.map(|v| BoundingBox {
        south: v.southwest.lat,
        north: v.northeast.lat,
        west: v.southwest.lng,
        east: v.northeast.lng,
    });

    Ok(Some(GeocodeResult {
        latitude: first.geometry.location.lat,
        longitude: first.geometry.location.lng,
        formatted_address: first.formatted_address,
        place_id: first.place_id,
        postcode,
        bbox,
        provenance: Provenance::Live,
    }))
}

/// Fixed-table provider for offline runs and tests. Counts every lookup.
#[derive(Debug, Default)]
pub struct StaticProvider {
    entries: HashMap<String, GeocodeResult>,
    failing: HashMap<String, String>,
    flaky: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, query: &str, result: GeocodeResult) -> Self {
        self.entries.insert(GeocodeQuery::normalize(query), result);
        self
    }

    pub fn with_failure(mut self, query: &str, message: &str) -> Self {
        self.failing
            .insert(GeocodeQuery::normalize(query), message.to_string());
        self
    }

    /// Answer `query` with a retryable error for the first `failures` lookups.
    pub fn with_transient_failures(self, query: &str, failures: usize) -> Self {
        if let Ok(mut flaky) = self.flaky.lock() {
            flaky.insert(GeocodeQuery::normalize(query), failures);
        }
        self
    }

    /// Simulated network latency per lookup.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeocodeProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn lookup(&self, query: &GeocodeQuery) -> Result<Option<GeocodeResult>, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.failing.get(&query.key) {
            return Err(GeocodeError::Provider(message.clone()));
        }
        if let Ok(mut flaky) = self.flaky.lock() {
            if let Some(left) = flaky.get_mut(&query.key).filter(|left| **left > 0) {
                *left -= 1;
                return Err(GeocodeError::Unavailable("simulated 503".into()));
            }
        }
        Ok(self
            .entries
            .get(&query.key)
            .cloned()
            .map(|r| r.with_provenance(Provenance::Live)))
    }
}
