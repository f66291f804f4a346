use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::model::WeatherSnapshot;

use super::{ProviderError, ProviderId, WeatherProvider, error_for_status, error_for_transport};

const DEFAULT_BASE_URL: &str = "https://api.weatherapi.com";

/// WeatherAPI.com answers an unknown location with 400 and this error code.
const NO_MATCHING_LOCATION: u32 = 1006;

#[derive(Debug, Clone)]
pub struct WeatherApiProvider {
    api_key: String,
    base_url: String,
    http: Client,
}

impl WeatherApiProvider {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            http: Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct WaLocation {
    name: String,
    country: String,
    localtime_epoch: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WaCondition {
    text: String,
}

#[derive(Debug, Deserialize)]
struct WaCurrent {
    temp_c: f64,
    humidity: u8,
    wind_kph: f64,
    condition: WaCondition,
    last_updated_epoch: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WaResponse {
    location: WaLocation,
    current: WaCurrent,
}

#[derive(Debug, Deserialize)]
struct WaErrorBody {
    error: WaErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WaErrorDetail {
    code: u32,
}

fn is_unknown_location(status: StatusCode, body: &str) -> bool {
    status == StatusCode::BAD_REQUEST
        && serde_json::from_str::<WaErrorBody>(body)
            .is_ok_and(|b| b.error.code == NO_MATCHING_LOCATION)
}

#[async_trait]
impl WeatherProvider for WeatherApiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::WeatherApi
    }

    async fn fetch(&self, city: &str) -> Result<WeatherSnapshot, ProviderError> {
        let id = self.id();
        let url = format!("{}/v1/current.json", self.base_url);

        let res = self
            .http
            .get(&url)
            .query(&[("key", self.api_key.as_str()), ("q", city)])
            .send()
            .await
            .map_err(|e| error_for_transport(id, &e))?;

        let status = res.status();
        let body = res.text().await.map_err(|e| error_for_transport(id, &e))?;

        if !status.is_success() {
            tracing::debug!(%city, %status, "WeatherAPI request failed");
            if is_unknown_location(status, &body) {
                return Err(ProviderError::NotFound { provider: id, city: city.to_owned() });
            }
            return Err(error_for_status(id, city, status, &body));
        }

        let parsed: WaResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Malformed { provider: id, message: e.to_string() })?;

        let ts = parsed.current.last_updated_epoch.or(parsed.location.localtime_epoch);
        let observed_at =
            ts.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)).unwrap_or_else(Utc::now);

        Ok(WeatherSnapshot {
            city: parsed.location.name,
            country: parsed.location.country,
            temperature_c: parsed.current.temp_c,
            description: parsed.current.condition.text,
            humidity_pct: parsed.current.humidity,
            wind_speed_mps: parsed.current.wind_kph / 3.6,
            observed_at,
            served_from_cache: false,
            stale: false,
        })
    }
}
