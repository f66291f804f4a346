use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Current conditions for one city, as reported by an upstream provider.
///
/// The two flags tell callers where the value came from: a fresh upstream
/// fetch (`false`/`false`), a fresh cache hit (`true`/`false`) or a degraded
/// stale serve (`true`/`true`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub city: String,
    pub country: String,
    pub temperature_c: f64,
    pub description: String,
    pub humidity_pct: u8,
    pub wind_speed_mps: f64,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub served_from_cache: bool,
    #[serde(default)]
    pub stale: bool,
}

impl WeatherSnapshot {
    pub(crate) fn fresh(self) -> Self {
        Self { served_from_cache: false, stale: false, ..self }
    }

    pub(crate) fn cached(self) -> Self {
        Self { served_from_cache: true, stale: false, ..self }
    }

    pub(crate) fn degraded(self) -> Self {
        Self { served_from_cache: true, stale: true, ..self }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItemResult {
    Success(WeatherSnapshot),
    Failure { city: String, kind: ErrorKind, message: String },
}

impl BatchItemResult {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchItemResult::Success(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

/// Per-city outcomes in input order, plus counts over them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub items: Vec<BatchItemResult>,
    pub summary: BatchSummary,
}

impl BatchResult {
    pub fn from_items(items: Vec<BatchItemResult>) -> Self {
        let success = items.iter().filter(|item| item.is_success()).count();
        let summary = BatchSummary { total: items.len(), success, failed: items.len() - success };
        Self { items, summary }
    }
}
