//! Wires the resilience components together from a [`Config`].

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::time::Instant;

use crate::{
    Config,
    batch::BatchCoordinator,
    cache::{CacheKey, CacheStore, InMemoryCacheStore},
    circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitStatus},
    clock::{Clock, SystemClock},
    error::{BatchError, LookupError},
    model::{BatchResult, WeatherSnapshot},
    orchestrator::WeatherOrchestrator,
    provider::{WeatherProvider, default_provider_from_config},
    retry::RetryExecutor,
};

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub provider: String,
    pub healthy: bool,
    pub circuit: CircuitBreakerState,
    /// `None` when the cache backend could not be reached.
    pub cached_entries: Option<usize>,
    /// Outcome of a direct upstream call; `None` unless one was requested.
    pub upstream_reachable: Option<bool>,
}

/// City used for upstream checks when the caller names none.
pub const DEFAULT_CHECK_CITY: &str = "London";

#[derive(Debug, Clone)]
pub struct WeatherService {
    orchestrator: Arc<WeatherOrchestrator>,
    batch: BatchCoordinator,
    provider_name: String,
}

impl WeatherService {
    /// Builds a service around the configured default provider.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.resilience.validate()?;
        let provider: Arc<dyn WeatherProvider> = Arc::from(default_provider_from_config(config)?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new(clock.clone()));
        Ok(Self::assemble(config, provider, cache, clock))
    }

    /// Builds a service from explicit collaborators.
    pub fn assemble(
        config: &Config,
        provider: Arc<dyn WeatherProvider>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let settings = &config.resilience;
        let provider_name = provider.id().to_string();

        let breaker = Arc::new(CircuitBreaker::new(
            provider_name.clone(),
            settings.failure_threshold,
            settings.recovery_window(),
            clock,
        ));
        let orchestrator = Arc::new(
            WeatherOrchestrator::new(
                cache,
                breaker,
                RetryExecutor::new(settings.retry_policy()),
                provider,
            )
            .with_cache_ttl(settings.cache_ttl()),
        );
        let batch = BatchCoordinator::new(orchestrator.clone())
            .with_size_limit(settings.batch_size_limit)
            .with_concurrency(settings.batch_concurrency);

        Self { orchestrator, batch, provider_name }
    }

    pub async fn lookup(
        &self,
        city: &str,
        deadline: Option<Instant>,
    ) -> Result<WeatherSnapshot, LookupError> {
        self.orchestrator.lookup(city, deadline).await
    }

    pub async fn lookup_batch<S: AsRef<str>>(
        &self,
        cities: &[S],
        deadline: Option<Instant>,
    ) -> Result<BatchResult, BatchError> {
        self.batch.lookup_batch(cities, deadline).await
    }

    /// Healthy while the circuit is not open. Makes no upstream call.
    pub async fn health(&self) -> HealthReport {
        self.report(None).await
    }

    /// Like [`health`](Self::health), but also fetches `city` straight from
    /// the provider. The check bypasses cache, retries and circuit breaker,
    /// so its outcome never moves breaker state. A blank `city` checks
    /// [`DEFAULT_CHECK_CITY`].
    pub async fn check_upstream(&self, city: &str, deadline: Option<Instant>) -> HealthReport {
        let target = match CacheKey::normalize(city) {
            Some(key) => key.to_string(),
            None => DEFAULT_CHECK_CITY.to_lowercase(),
        };
        let city = target.as_str();
        let provider = self.orchestrator.provider();
        let fetch = provider.fetch(city);
        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fetch).await.ok(),
            None => Some(fetch.await),
        };

        let reachable = match outcome {
            Some(Ok(_)) => {
                tracing::info!(provider = %provider.id(), city, "upstream check passed");
                true
            }
            Some(Err(err)) => {
                tracing::warn!(provider = %provider.id(), city, error = %err, "upstream check failed");
                false
            }
            None => {
                tracing::warn!(provider = %provider.id(), city, "upstream check timed out");
                false
            }
        };
        self.report(Some(reachable)).await
    }

    async fn report(&self, upstream_reachable: Option<bool>) -> HealthReport {
        let circuit = self.orchestrator.breaker().state();
        let cached_entries = match self.orchestrator.cache().entry_count().await {
            Ok(n) => Some(n),
            Err(err) => {
                tracing::warn!(error = %err, "cache health check failed");
                None
            }
        };

        HealthReport {
            provider: self.provider_name.clone(),
            healthy: circuit.status != CircuitStatus::Open && upstream_reachable != Some(false),
            circuit,
            cached_entries,
            upstream_reachable,
        }
    }
}
