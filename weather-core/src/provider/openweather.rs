use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::model::WeatherSnapshot;

use super::{
    ProviderError, ProviderId, WeatherProvider, error_for_status, error_for_transport, title_case,
};

const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org";

#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    api_key: String,
    base_url: String,
    http: Client,
}

impl OpenWeatherProvider {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            http: Client::builder().timeout(timeout).build()?,
        })
    }

    /// Points the client at another host, e.g. a mock server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct OwMain {
    temp: f64,
    humidity: u8,
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    description: String,
}

#[derive(Debug, Deserialize)]
struct OwWind {
    speed: f64,
}

#[derive(Debug, Default, Deserialize)]
struct OwSys {
    #[serde(default)]
    country: String,
}

#[derive(Debug, Deserialize)]
struct OwCurrentResponse {
    name: String,
    dt: i64,
    main: OwMain,
    weather: Vec<OwWeather>,
    wind: OwWind,
    #[serde(default)]
    sys: OwSys,
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenWeather
    }

    async fn fetch(&self, city: &str) -> Result<WeatherSnapshot, ProviderError> {
        let id = self.id();
        let url = format!("{}/data/2.5/weather", self.base_url);

        let res = self
            .http
            .get(&url)
            .query(&[("q", city), ("appid", self.api_key.as_str()), ("units", "metric")])
            .send()
            .await
            .map_err(|e| error_for_transport(id, &e))?;

        let status = res.status();
        let body = res.text().await.map_err(|e| error_for_transport(id, &e))?;

        if !status.is_success() {
            tracing::debug!(%city, %status, "OpenWeather request failed");
            return Err(error_for_status(id, city, status, &body));
        }

        let parsed: OwCurrentResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Malformed { provider: id, message: e.to_string() })?;

        let description = parsed
            .weather
            .first()
            .map(|w| title_case(&w.description))
            .unwrap_or_else(|| "Unknown".to_string());

        Ok(WeatherSnapshot {
            city: parsed.name,
            country: parsed.sys.country,
            temperature_c: parsed.main.temp,
            description,
            humidity_pct: parsed.main.humidity,
            wind_speed_mps: parsed.wind.speed,
            observed_at: DateTime::<Utc>::from_timestamp(parsed.dt, 0).unwrap_or_else(Utc::now),
            served_from_cache: false,
            stale: false,
        })
    }
}
