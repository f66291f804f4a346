//! Core library for the `weather` CLI.
//!
//! This crate defines:
//! - Configuration & credentials handling
//! - Abstraction over weather providers, with upstream failures classified
//!   as transient or permanent
//! - A lookup pipeline that shields callers from a flaky upstream: TTL cache,
//!   bounded retries with jittered backoff, a circuit breaker and stale
//!   fallback
//! - Batch lookups with bounded concurrency and partial failure
//!
//! It is used by `weather-cli`, but can also be reused by other binaries or services.

pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod service;

pub use batch::BatchCoordinator;
pub use cache::{CacheKey, CacheStore, InMemoryCacheStore};
pub use circuit_breaker::{CircuitBreaker, CircuitStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ProviderConfig, ResilienceConfig};
pub use error::{BatchError, ErrorKind, LookupError};
pub use model::{BatchItemResult, BatchResult, BatchSummary, WeatherSnapshot};
pub use orchestrator::WeatherOrchestrator;
pub use provider::{ProviderError, ProviderId, WeatherProvider};
pub use retry::{RetryExecutor, RetryPolicy};
pub use service::{DEFAULT_CHECK_CITY, HealthReport, WeatherService};
