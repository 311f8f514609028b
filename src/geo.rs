//! Geocoding and driving distances through the Google Maps web services.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

impl fmt::Display for LatLng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

/// One destination of a distance-matrix response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RouteElement {
    Route { distance_km: f64, duration_minutes: f64 },
    NoRoute,
}

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("maps API unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("maps API server error {0}")]
    Server(u16),
    #[error("REQUEST_DENIED: {0}")]
    RequestDenied(String),
    #[error("OVER_DAILY_LIMIT: {0}")]
    OverDailyLimit(String),
    #[error("OVER_QUERY_LIMIT: {0}")]
    OverQueryLimit(String),
    #[error("INVALID_REQUEST: {0}")]
    InvalidRequest(String),
    #[error("maps API status {status}: {message}")]
    Other { status: String, message: String },
}

impl GeoError {
    /// Network failures, HTTP 5xx and Google's `UNKNOWN_ERROR`.
    pub fn is_retryable(&self) -> bool {
        match self {
            GeoError::Transport(_) | GeoError::Server(_) => true,
            GeoError::Other { status, .. } => status == "UNKNOWN_ERROR",
            _ => false,
        }
    }

    /// Errors no later request can fix: the whole job has to stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GeoError::RequestDenied(_) | GeoError::OverDailyLimit(_) | GeoError::OverQueryLimit(_)
        )
    }

    pub fn hint(&self) -> &'static str {
        match self {
            GeoError::RequestDenied(_) => {
                "Google rejected the API key: check that Geocoding and Distance Matrix are enabled for it"
            }
            GeoError::OverDailyLimit(_) => {
                "Google Maps billing is not active or the daily limit was reached"
            }
            GeoError::OverQueryLimit(_) => "Google Maps query quota exceeded; try again later",
            GeoError::InvalidRequest(_) => "the request sent to Google Maps was malformed",
            GeoError::Transport(_) | GeoError::Server(_) => {
                "Google Maps is temporarily unavailable"
            }
            GeoError::Other { .. } => "Google Maps returned an unexpected response",
        }
    }
}

#[async_trait]
pub trait GeoApi: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Option<LatLng>, GeoError>;

    async fn distance_matrix(
        &self,
        origin: LatLng,
        destinations: &[LatLng],
    ) -> Result<Vec<RouteElement>, GeoError>;
}

#[derive(Clone)]
pub struct GoogleMapsClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for GoogleMapsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleMapsClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GoogleMapsClient {
    pub fn new(base_url: &str, api_key: String) -> anyhow::Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("invalid maps url {}", base))?;
        let http = Client::builder()
            .user_agent("portal-sync/0.1")
            .build()
            .context("failed to build maps http client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn geocode_url(&self, address: &str) -> anyhow::Result<Url> {
        let mut url = self.base_url.join("maps/api/geocode/json")?;
        url.query_pairs_mut()
            .append_pair("address", address)
            .append_pair("region", "br")
            .append_pair("language", "pt-BR")
            .append_pair("key", &self.api_key);
        Ok(url)
    }

    pub fn matrix_url(&self, origin: LatLng, destinations: &[LatLng]) -> anyhow::Result<Url> {
        let dests: Vec<String> = destinations.iter().map(|d| d.to_string()).collect();
        let mut url = self.base_url.join("maps/api/distancematrix/json")?;
        url.query_pairs_mut()
            .append_pair("origins", &origin.to_string())
            .append_pair("destinations", &dests.join("|"))
            .append_pair("units", "metric")
            .append_pair("mode", "driving")
            .append_pair("key", &self.api_key);
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value, GeoError> {
        let res = self.http.get(url.clone()).send().await?;
        let status = res.status();
        if status.is_server_error() {
            warn!(path = url.path(), %status, "maps API server error");
            return Err(GeoError::Server(status.as_u16()));
        }
        let body: Value = res.json().await?;
        if !status.is_success() {
            return Err(GeoError::Other {
                status: status.as_u16().to_string(),
                message: error_message(&body),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl GeoApi for GoogleMapsClient {
    async fn geocode(&self, address: &str) -> Result<Option<LatLng>, GeoError> {
        let url = self.geocode_url(address).map_err(|e| GeoError::InvalidRequest(e.to_string()))?;
        debug!(address, "geocoding");
        parse_geocode(&self.get_json(url).await?)
    }

    async fn distance_matrix(
        &self,
        origin: LatLng,
        destinations: &[LatLng],
    ) -> Result<Vec<RouteElement>, GeoError> {
        if destinations.is_empty() {
            return Ok(Vec::new());
        }
        let url = self
            .matrix_url(origin, destinations)
            .map_err(|e| GeoError::InvalidRequest(e.to_string()))?;
        debug!(destinations = destinations.len(), "requesting distance matrix");
        parse_matrix(&self.get_json(url).await?, destinations.len())
    }
}

fn error_message(body: &Value) -> String {
    body.get("error_message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn status_error(status: &str, body: &Value) -> GeoError {
    let message = error_message(body);
    match status {
        "REQUEST_DENIED" => GeoError::RequestDenied(message),
        "OVER_DAILY_LIMIT" => GeoError::OverDailyLimit(message),
        "OVER_QUERY_LIMIT" => GeoError::OverQueryLimit(message),
        "INVALID_REQUEST" => GeoError::InvalidRequest(message),
        other => GeoError::Other {
            status: other.to_string(),
            message,
        },
    }
}

pub fn parse_geocode(body: &Value) -> Result<Option<LatLng>, GeoError> {
    let status = body.get("status").and_then(Value::as_str).unwrap_or("");
    match status {
        "OK" => {
            let location = body
                .pointer("/results/0/geometry/location")
                .ok_or_else(|| GeoError::Other {
                    status: "OK".into(),
                    message: "result without geometry".into(),
                })?;
            match (
                location.get("lat").and_then(Value::as_f64),
                location.get("lng").and_then(Value::as_f64),
            ) {
                (Some(lat), Some(lng)) => Ok(Some(LatLng { lat, lng })),
                _ => Err(GeoError::Other {
                    status: "OK".into(),
                    message: "location without coordinates".into(),
                }),
            }
        }
        "ZERO_RESULTS" => Ok(None),
        other => Err(status_error(other, body)),
    }
}

pub fn parse_matrix(body: &Value, expected: usize) -> Result<Vec<RouteElement>, GeoError> {
    let status = body.get("status").and_then(Value::as_str).unwrap_or("");
    if status != "OK" {
        return Err(status_error(status, body));
    }
    let elements = body
        .pointer("/rows/0/elements")
        .and_then(Value::as_array)
        .ok_or_else(|| GeoError::Other {
            status: "OK".into(),
            message: "matrix without elements".into(),
        })?;
    if elements.len() != expected {
        return Err(GeoError::Other {
            status: "OK".into(),
            message: format!("expected {} elements, got {}", expected, elements.len()),
        });
    }
    Ok(elements
        .iter()
        .map(|el| {
            let meters = el.pointer("/distance/value").and_then(Value::as_f64);
            let seconds = el.pointer("/duration/value").and_then(Value::as_f64);
            match (el.get("status").and_then(Value::as_str), meters, seconds) {
                (Some("OK"), Some(m), Some(s)) => RouteElement::Route {
                    distance_km: m / 1000.0,
                    duration_minutes: s / 60.0,
                },
                _ => RouteElement::NoRoute,
            }
        })
        .collect())
}

/// Great-circle distance in kilometres.
pub fn haversine_km(a: LatLng, b: LatLng) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn haversine_sao_paulo_to_rio() {
        let sp = LatLng::new(-23.5505, -46.6333);
        let rio = LatLng::new(-22.9068, -43.1729);
        let d = haversine_km(sp, rio);
        assert!((d - 360.7).abs() < 2.0, "got {}", d);
        assert_eq!(haversine_km(sp, sp), 0.0);
    }

    #[test]
    fn geocode_statuses() {
        let ok = json!({
            "status": "OK",
            "results": [{ "geometry": { "location": { "lat": -22.9, "lng": -47.06 } } }]
        });
        assert_eq!(parse_geocode(&ok).unwrap(), Some(LatLng::new(-22.9, -47.06)));
        assert_eq!(parse_geocode(&json!({ "status": "ZERO_RESULTS" })).unwrap(), None);
        let denied = parse_geocode(&json!({ "status": "REQUEST_DENIED", "error_message": "bad key" }))
            .unwrap_err();
        assert!(matches!(denied, GeoError::RequestDenied(ref m) if m == "bad key"));
        assert!(denied.is_fatal());
        assert!(!denied.is_retryable());
    }

    #[test]
    fn matrix_maps_no_route() {
        let body = json!({
            "status": "OK",
            "rows": [{ "elements": [
                { "status": "OK", "distance": { "value": 98500 }, "duration": { "value": 5400 } },
                { "status": "ZERO_RESULTS" }
            ]}]
        });
        let els = parse_matrix(&body, 2).unwrap();
        assert_eq!(
            els[0],
            RouteElement::Route {
                distance_km: 98.5,
                duration_minutes: 90.0
            }
        );
        assert_eq!(els[1], RouteElement::NoRoute);
        assert!(parse_matrix(&body, 3).is_err());
    }

    #[test]
    fn urls_carry_expected_params() {
        let client = GoogleMapsClient::new("https://maps.example.com", "KEY".into()).unwrap();
        let url = client.geocode_url("Campinas, SP, Brasil").unwrap();
        assert_eq!(url.path(), "/maps/api/geocode/json");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("region".into(), "br".into())));
        assert!(pairs.contains(&("language".into(), "pt-BR".into())));
        assert!(pairs.contains(&("address".into(), "Campinas, SP, Brasil".into())));

        let url = client
            .matrix_url(LatLng::new(-23.5, -46.6), &[LatLng::new(-22.9, -47.0), LatLng::new(-21.0, -47.8)])
            .unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("destinations".into(), "-22.9,-47|-21,-47.8".into())));
        assert!(pairs.contains(&("mode".into(), "driving".into())));
        assert!(pairs.contains(&("units".into(), "metric".into())));
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(GeoError::Server(503).is_retryable());
        assert!(!GeoError::OverDailyLimit(String::new()).is_retryable());
        assert!(GeoError::OverQueryLimit(String::new()).is_fatal());
    }
}
