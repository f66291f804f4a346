use crate::{
    Config, WeatherSnapshot,
    provider::{openweather::OpenWeatherProvider, weatherapi::WeatherApiProvider},
    retry::{Classify, ErrorClass},
};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::{convert::TryFrom, fmt::Debug, time::Duration};
use thiserror::Error;

pub mod openweather;
pub mod weatherapi;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    OpenWeather,
    WeatherApi,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenWeather => "openweather",
            ProviderId::WeatherApi => "weatherapi",
        }
    }

    pub const fn all() -> &'static [ProviderId] {
        &[ProviderId::OpenWeather, ProviderId::WeatherApi]
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "openweather" => Ok(ProviderId::OpenWeather),
            "weatherapi" => Ok(ProviderId::WeatherApi),
            _ => Err(anyhow::anyhow!(
                "Unknown provider '{value}'. Supported providers: openweather, weatherapi."
            )),
        }
    }
}

/// Upstream failure, already reduced to a shape the rest of the core understands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("{provider}: city '{city}' not found")]
    NotFound { provider: ProviderId, city: String },

    #[error("{provider}: request rejected with status {status}: {message}")]
    Rejected { provider: ProviderId, status: u16, message: String },

    #[error("{provider}: upstream returned status {status}: {message}")]
    Server { provider: ProviderId, status: u16, message: String },

    #[error("{provider}: request timed out")]
    Timeout { provider: ProviderId },

    #[error("{provider}: connection failed: {message}")]
    Connection { provider: ProviderId, message: String },

    #[error("{provider}: could not decode response: {message}")]
    Malformed { provider: ProviderId, message: String },
}

impl Classify for ProviderError {
    fn class(&self) -> ErrorClass {
        match self {
            ProviderError::NotFound { .. } | ProviderError::Rejected { .. } => {
                ErrorClass::Permanent
            }
            ProviderError::Server { .. }
            | ProviderError::Timeout { .. }
            | ProviderError::Connection { .. }
            | ProviderError::Malformed { .. } => ErrorClass::Transient,
        }
    }
}

/// Maps a non-success status to a classified error.
///
/// 404 is an unknown city, 408/429/5xx are worth retrying, every other 4xx
/// means the request itself is wrong.
pub(crate) fn error_for_status(
    provider: ProviderId,
    city: &str,
    status: StatusCode,
    body: &str,
) -> ProviderError {
    let message = truncate_body(body);

    if status == StatusCode::NOT_FOUND {
        return ProviderError::NotFound { provider, city: city.to_owned() };
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return ProviderError::Server { provider, status: status.as_u16(), message };
    }
    if status.is_client_error() {
        return ProviderError::Rejected { provider, status: status.as_u16(), message };
    }
    ProviderError::Server { provider, status: status.as_u16(), message }
}

/// Maps a transport-level failure to a classified error.
pub(crate) fn error_for_transport(provider: ProviderId, err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout { provider }
    } else if err.is_decode() {
        ProviderError::Malformed { provider, message: err.to_string() }
    } else {
        ProviderError::Connection { provider, message: err.to_string() }
    }
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Title-cases each word, e.g. "broken clouds" -> "Broken Clouds".
pub(crate) fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    fn id(&self) -> ProviderId;

    /// Current conditions for `city`. Both cache flags on the result are `false`.
    async fn fetch(&self, city: &str) -> Result<WeatherSnapshot, ProviderError>;
}

/// Construct a provider from config and explicit ProviderId.
pub fn provider_from_config(
    id: ProviderId,
    config: &Config,
) -> anyhow::Result<Box<dyn WeatherProvider>> {
    let api_key = config.provider_api_key(id).ok_or_else(|| {
        anyhow::anyhow!(
            "No API key configured for provider '{id}'.\n\
                 Hint: run `weather configure {id}` and enter your API key."
        )
    })?;
    let timeout = config.resilience.request_timeout();

    let boxed: Box<dyn WeatherProvider> = match id {
        ProviderId::OpenWeather => {
            Box::new(OpenWeatherProvider::new(api_key.to_owned(), timeout)?)
        }
        ProviderId::WeatherApi => Box::new(WeatherApiProvider::new(api_key.to_owned(), timeout)?),
    };

    Ok(boxed)
}

/// Construct the default provider from config, using `default_provider` field.
pub fn default_provider_from_config(config: &Config) -> anyhow::Result<Box<dyn WeatherProvider>> {
    let id = config.default_provider_id()?;
    provider_from_config(id, config)
}
