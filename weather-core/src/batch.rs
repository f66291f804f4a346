//! Multi-city lookups with bounded concurrency and per-city failure isolation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;

use crate::cache::CacheKey;
use crate::error::{BatchError, LookupError};
use crate::model::{BatchItemResult, BatchResult};
use crate::orchestrator::WeatherOrchestrator;

pub const DEFAULT_BATCH_SIZE_LIMIT: usize = 50;
pub const DEFAULT_BATCH_CONCURRENCY: usize = 10;

#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    orchestrator: Arc<WeatherOrchestrator>,
    size_limit: usize,
    concurrency: usize,
}

impl BatchCoordinator {
    pub fn new(orchestrator: Arc<WeatherOrchestrator>) -> Self {
        Self {
            orchestrator,
            size_limit: DEFAULT_BATCH_SIZE_LIMIT,
            concurrency: DEFAULT_BATCH_CONCURRENCY,
        }
    }

    pub fn with_size_limit(mut self, limit: usize) -> Self {
        self.size_limit = limit;
        self
    }

    /// At most `limit` lookups run at once; zero is treated as one.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    /// Looks up every city and returns one item per input, in input order.
    ///
    /// Spellings that normalize to the same key share one lookup. The size
    /// limit bounds the number of inputs, duplicates and blanks included, and
    /// is checked before any upstream call.
    pub async fn lookup_batch<S: AsRef<str>>(
        &self,
        cities: &[S],
        deadline: Option<Instant>,
    ) -> Result<BatchResult, BatchError> {
        if cities.is_empty() {
            return Err(BatchError::Empty);
        }
        if cities.len() > self.size_limit {
            return Err(BatchError::TooMany { count: cities.len(), limit: self.size_limit });
        }

        let keys: Vec<Option<CacheKey>> =
            cities.iter().map(|city| CacheKey::normalize(city.as_ref())).collect();

        let mut seen = HashSet::new();
        let distinct: Vec<(&CacheKey, &str)> = keys
            .iter()
            .zip(cities)
            .filter_map(|(key, raw)| key.as_ref().map(|key| (key, raw.as_ref())))
            .filter(|(key, _)| seen.insert(*key))
            .collect();

        tracing::info!(
            requested = cities.len(),
            distinct = distinct.len(),
            concurrency = self.concurrency,
            "starting batch lookup"
        );

        let orchestrator = self.orchestrator.as_ref();
        let outcomes: HashMap<&CacheKey, BatchItemResult> = stream::iter(distinct)
            .map(|(key, raw)| async move {
                let item = match orchestrator.lookup(raw, deadline).await {
                    Ok(snapshot) => BatchItemResult::Success(snapshot),
                    Err(err) => failure(raw, &err),
                };
                (key, item)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let items: Vec<BatchItemResult> = keys
            .iter()
            .zip(cities)
            .map(|(key, raw)| match key.as_ref().and_then(|k| outcomes.get(k)) {
                Some(BatchItemResult::Success(snapshot)) => BatchItemResult::Success(snapshot.clone()),
                // A shared failure is reported under each position's own spelling.
                Some(BatchItemResult::Failure { kind, message, .. }) => BatchItemResult::Failure {
                    city: raw.as_ref().trim().to_string(),
                    kind: *kind,
                    message: message.clone(),
                },
                None => failure(raw.as_ref(), &LookupError::InvalidCity),
            })
            .collect();

        let result = BatchResult::from_items(items);
        tracing::info!(
            total = result.summary.total,
            success = result.summary.success,
            failed = result.summary.failed,
            "batch lookup finished"
        );
        Ok(result)
    }
}

fn failure(city: &str, err: &LookupError) -> BatchItemResult {
    let kind = err.kind();
    tracing::debug!(%city, %kind, error = %err, "batch item failed");
    BatchItemResult::Failure { city: city.trim().to_string(), kind, message: err.to_string() }
}
