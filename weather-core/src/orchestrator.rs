//! Single-city lookup: cache, circuit breaker, retries and degraded fallback.
//!
//! Permanent upstream failures (unknown city, rejected request) never reach
//! the circuit breaker. Only transient failures that survive every retry are
//! recorded against it, so a stream of bad input cannot trip the breaker for
//! a healthy upstream.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::cache::{CacheKey, CacheStore};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::LookupError;
use crate::model::WeatherSnapshot;
use crate::provider::WeatherProvider;
use crate::retry::{RetryError, RetryExecutor};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub struct WeatherOrchestrator {
    cache: Arc<dyn CacheStore>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
    provider: Arc<dyn WeatherProvider>,
    cache_ttl: Duration,
}

impl WeatherOrchestrator {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryExecutor,
        provider: Arc<dyn WeatherProvider>,
    ) -> Self {
        Self { cache, breaker, retry, provider, cache_ttl: DEFAULT_CACHE_TTL }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &dyn CacheStore {
        self.cache.as_ref()
    }

    pub fn provider(&self) -> &dyn WeatherProvider {
        self.provider.as_ref()
    }

    /// Looks up current weather for `city`, giving up at `deadline` if one is set.
    ///
    /// A missed deadline abandons whatever is in flight, including a retry
    /// back-off, and is not counted against the circuit breaker.
    pub async fn lookup(
        &self,
        city: &str,
        deadline: Option<Instant>,
    ) -> Result<WeatherSnapshot, LookupError> {
        let key = CacheKey::normalize(city).ok_or(LookupError::InvalidCity)?;

        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.resolve(&key))
                .await
                .unwrap_or_else(|_| {
                    tracing::warn!(%key, "lookup deadline exceeded");
                    Err(LookupError::Timeout { city: key.to_string() })
                }),
            None => self.resolve(&key).await,
        }
    }

    async fn resolve(&self, key: &CacheKey) -> Result<WeatherSnapshot, LookupError> {
        match self.cache.get(key).await {
            Ok(Some(entry)) => return Ok(entry.value.cached()),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(%key, error = %err, "cache read failed; going to upstream");
            }
        }

        let Some(permit) = self.breaker.allow_request() else {
            tracing::debug!(%key, breaker = self.breaker.name(), "circuit open; skipping upstream");
            return self
                .stale_fallback(key)
                .await
                .ok_or_else(|| LookupError::CircuitOpen { city: key.to_string() });
        };

        let provider = self.provider.as_ref();
        let outcome = self
            .retry
            .execute(move |attempt| {
                tracing::debug!(%key, attempt, provider = %provider.id(), "fetching from upstream");
                provider.fetch(key.as_str())
            })
            .await;

        match outcome {
            Ok(snapshot) => {
                permit.record_success();
                let snapshot = snapshot.fresh();
                if let Err(err) = self.cache.put(key, snapshot.clone(), self.cache_ttl).await {
                    tracing::warn!(%key, error = %err, "cache write failed; returning uncached result");
                }
                Ok(snapshot)
            }
            Err(RetryError::Permanent(source)) => {
                // Caller input problem; an unjudged trial reopens the circuit.
                drop(permit);
                tracing::info!(%key, error = %source, "city rejected by upstream");
                Err(LookupError::CityNotFound { city: key.to_string(), source })
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                permit.record_failure();
                match self.stale_fallback(key).await {
                    Some(snapshot) => Ok(snapshot),
                    None => Err(LookupError::UpstreamUnavailable {
                        city: key.to_string(),
                        attempts,
                        source: last,
                    }),
                }
            }
        }
    }

    async fn stale_fallback(&self, key: &CacheKey) -> Option<WeatherSnapshot> {
        match self.cache.get_stale(key).await {
            Ok(Some(entry)) => {
                tracing::info!(%key, expires_at = %entry.expires_at, "serving stale weather");
                Some(entry.value.degraded())
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%key, error = %err, "stale cache read failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, CacheError, InMemoryCacheStore};
    use crate::circuit_breaker::CircuitStatus;
    use crate::clock::ManualClock;
    use crate::provider::{ProviderError, ProviderId};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays queued outcomes; once the queue is empty, repeats `fallback`.
    #[derive(Debug)]
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<WeatherSnapshot, ProviderError>>>,
        fallback: Result<WeatherSnapshot, ProviderError>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn always(outcome: Result<WeatherSnapshot, ProviderError>) -> Self {
            Self { script: Mutex::new(VecDeque::new()), fallback: outcome, calls: AtomicUsize::new(0) }
        }

        fn then(self, outcome: Result<WeatherSnapshot, ProviderError>) -> Self {
            self.script.lock().push_back(outcome);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WeatherProvider for ScriptedProvider {
        fn id(&self) -> ProviderId {
            ProviderId::OpenWeather
        }

        async fn fetch(&self, _city: &str) -> Result<WeatherSnapshot, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    /// A cache whose backend is down.
    #[derive(Debug)]
    struct BrokenCache;

    #[async_trait]
    impl CacheStore for BrokenCache {
        async fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn get_stale(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn put(&self, _: &CacheKey, _: WeatherSnapshot, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn entry_count(&self) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    fn seoul() -> WeatherSnapshot {
        WeatherSnapshot {
            city: "Seoul".into(),
            country: "KR".into(),
            temperature_c: 12.5,
            description: "Clear Sky".into(),
            humidity_pct: 40,
            wind_speed_mps: 3.1,
            observed_at: DateTime::<Utc>::UNIX_EPOCH,
            served_from_cache: false,
            stale: false,
        }
    }

    fn server_error() -> ProviderError {
        ProviderError::Server { provider: ProviderId::OpenWeather, status: 503, message: "down".into() }
    }

    fn not_found() -> ProviderError {
        ProviderError::NotFound { provider: ProviderId::OpenWeather, city: "atlantis".into() }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        provider: Arc<ScriptedProvider>,
        orchestrator: WeatherOrchestrator,
    }

    fn harness(provider: ScriptedProvider) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let provider = Arc::new(provider);
        let orchestrator = WeatherOrchestrator::new(
            Arc::new(InMemoryCacheStore::new(clock.clone())),
            Arc::new(CircuitBreaker::with_defaults("test", clock.clone())),
            RetryExecutor::new(RetryPolicy::default()),
            provider.clone(),
        );
        Harness { clock, provider, orchestrator }
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_fetch_then_cache_hit() {
        let h = harness(ScriptedProvider::always(Ok(seoul())));

        let first = h.orchestrator.lookup("Seoul", None).await.unwrap();
        assert!(!first.served_from_cache && !first.stale);

        let second = h.orchestrator.lookup("  seoul ", None).await.unwrap();
        assert!(second.served_from_cache && !second.stale);
        assert_eq!(h.provider.calls(), 1);

        assert_eq!(WeatherSnapshot { served_from_cache: false, ..second }, first);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_triggers_refetch() {
        let h = harness(ScriptedProvider::always(Ok(seoul())));

        h.orchestrator.lookup("Seoul", None).await.unwrap();
        h.clock.advance(DEFAULT_CACHE_TTL);
        let again = h.orchestrator.lookup("Seoul", None).await.unwrap();

        assert!(!again.served_from_cache);
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_city_is_rejected_without_upstream_call() {
        let h = harness(ScriptedProvider::always(Ok(seoul())));

        let err = h.orchestrator.lookup("   ", None).await.unwrap_err();
        assert!(matches!(err, LookupError::InvalidCity));
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_city_never_counts_against_breaker() {
        let h = harness(ScriptedProvider::always(Err(not_found())));

        for _ in 0..20 {
            let err = h.orchestrator.lookup("Atlantis", None).await.unwrap_err();
            assert!(matches!(err, LookupError::CityNotFound { .. }));
        }

        assert_eq!(h.provider.calls(), 20);
        let state = h.orchestrator.breaker().state();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fall_back_to_stale_entry() {
        let h = harness(ScriptedProvider::always(Err(server_error())).then(Ok(seoul())));

        h.orchestrator.lookup("Seoul", None).await.unwrap();
        h.clock.advance(DEFAULT_CACHE_TTL + Duration::from_secs(1));

        let degraded = h.orchestrator.lookup("Seoul", None).await.unwrap();
        assert!(degraded.served_from_cache && degraded.stale);
        assert_eq!(h.provider.calls(), 1 + 3);
        assert_eq!(h.orchestrator.breaker().state().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_without_cache_is_unavailable() {
        let h = harness(ScriptedProvider::always(Err(server_error())));

        let err = h.orchestrator.lookup("Seoul", None).await.unwrap_err();
        assert!(matches!(err, LookupError::UpstreamUnavailable { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast() {
        let h = harness(ScriptedProvider::always(Err(server_error())));

        for _ in 0..5 {
            h.orchestrator.lookup("Seoul", None).await.unwrap_err();
        }
        assert_eq!(h.orchestrator.breaker().state().status, CircuitStatus::Open);
        let calls_before = h.provider.calls();

        let err = h.orchestrator.lookup("Seoul", None).await.unwrap_err();
        assert!(matches!(err, LookupError::CircuitOpen { .. }));
        assert_eq!(h.provider.calls(), calls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_trial_closes_circuit() {
        let h = harness(ScriptedProvider::always(Err(server_error())));
        for _ in 0..5 {
            h.orchestrator.lookup("Seoul", None).await.unwrap_err();
        }

        h.provider.script.lock().push_back(Ok(seoul()));
        h.clock.advance(Duration::from_secs(60));

        let snapshot = h.orchestrator.lookup("Seoul", None).await.unwrap();
        assert!(!snapshot.served_from_cache);
        let state = h.orchestrator.breaker().state();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_city_during_trial_waits_for_the_next_window() {
        let h = harness(ScriptedProvider::always(Err(server_error())));
        for _ in 0..5 {
            h.orchestrator.lookup("Seoul", None).await.unwrap_err();
        }
        h.clock.advance(Duration::from_secs(60));
        h.provider.script.lock().push_back(Err(not_found()));

        h.orchestrator.lookup("Atlantis", None).await.unwrap_err();
        let state = h.orchestrator.breaker().state();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.consecutive_failures, 5);
        assert!(h.orchestrator.breaker().allow_request().is_none());

        h.clock.advance(Duration::from_secs(60));
        let permit = h.orchestrator.breaker().allow_request();
        assert!(permit.is_some_and(|p| p.is_trial()));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_abandons_retry_backoff() {
        let h = harness(ScriptedProvider::always(Err(server_error())));
        let deadline = Instant::now() + Duration::from_millis(500);

        let err = h.orchestrator.lookup("Seoul", Some(deadline)).await.unwrap_err();
        assert!(matches!(err, LookupError::Timeout { .. }));
        assert_eq!(h.provider.calls(), 1);

        let state = h.orchestrator.breaker().state();
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_outage_degrades_to_direct_upstream() {
        let clock = Arc::new(ManualClock::default());
        let provider = Arc::new(ScriptedProvider::always(Ok(seoul())));
        let orchestrator = WeatherOrchestrator::new(
            Arc::new(BrokenCache),
            Arc::new(CircuitBreaker::with_defaults("test", clock)),
            RetryExecutor::default(),
            provider.clone(),
        );

        let snapshot = orchestrator.lookup("Seoul", None).await.unwrap();
        assert_eq!(snapshot.city, "Seoul");
        assert!(!snapshot.served_from_cache);

        orchestrator.lookup("Seoul", None).await.unwrap();
        assert_eq!(provider.calls(), 2);
    }
}
