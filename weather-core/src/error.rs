//! Typed errors surfaced by single and batch lookups.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ProviderError;

/// Machine-readable failure category, carried by batch failure items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidCity,
    CityNotFound,
    UpstreamUnavailable,
    CircuitOpen,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidCity => "invalid_city",
            ErrorKind::CityNotFound => "city_not_found",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("city name must not be empty")]
    InvalidCity,

    #[error("city '{city}' not found: {source}")]
    CityNotFound {
        city: String,
        #[source]
        source: ProviderError,
    },

    #[error("weather upstream unavailable for '{city}' after {attempts} attempt(s): {source}")]
    UpstreamUnavailable {
        city: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("circuit breaker is open; no cached data for '{city}'")]
    CircuitOpen { city: String },

    #[error("lookup for '{city}' exceeded its deadline")]
    Timeout { city: String },
}

impl LookupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LookupError::InvalidCity => ErrorKind::InvalidCity,
            LookupError::CityNotFound { .. } => ErrorKind::CityNotFound,
            LookupError::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            LookupError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            LookupError::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// Rejections of the batch input as a whole. Per-city failures never show up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("batch must contain at least one city")]
    Empty,

    #[error("batch contains {count} distinct cities; at most {limit} are allowed")]
    TooMany { count: usize, limit: usize },
}
