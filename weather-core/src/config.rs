use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use crate::{
    batch::{DEFAULT_BATCH_CONCURRENCY, DEFAULT_BATCH_SIZE_LIMIT},
    circuit_breaker::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_WINDOW},
    orchestrator::DEFAULT_CACHE_TTL,
    provider::{DEFAULT_REQUEST_TIMEOUT, ProviderId},
    retry::{
        DEFAULT_BASE_DELAY, DEFAULT_JITTER_FRACTION, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
        RetryPolicy,
    },
};

/// Configuration for a single provider (e.g., API key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Optional default provider id, e.g. "openweather" or "weatherapi".
    pub default_provider: Option<String>,

    /// Example TOML:
    /// [providers.openweather]
    /// api_key = "..."
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Caching, retry, circuit-breaker and batch tuning.
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

/// Example TOML:
/// [resilience]
/// cache_ttl_secs = 600
/// retry_max_attempts = 3
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub cache_ttl_secs: u64,
    pub failure_threshold: u32,
    pub recovery_window_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_jitter_fraction: f64,
    pub retry_max_delay_ms: u64,
    pub batch_size_limit: usize,
    pub batch_concurrency: usize,
    pub request_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: DEFAULT_CACHE_TTL.as_secs(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_window_secs: DEFAULT_RECOVERY_WINDOW.as_secs(),
            retry_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            retry_jitter_fraction: DEFAULT_JITTER_FRACTION,
            retry_max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            batch_size_limit: DEFAULT_BATCH_SIZE_LIMIT,
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

impl ResilienceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry_max_attempts == 0 {
            bail!("resilience.retry_max_attempts must be at least 1");
        }
        if self.failure_threshold == 0 {
            bail!("resilience.failure_threshold must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_fraction) {
            bail!(
                "resilience.retry_jitter_fraction must be within [0, 1], got {}",
                self.retry_jitter_fraction
            );
        }
        if self.batch_size_limit == 0 || self.batch_concurrency == 0 {
            bail!("resilience.batch_size_limit and batch_concurrency must be at least 1");
        }
        if self.batch_concurrency > self.batch_size_limit {
            bail!(
                "resilience.batch_concurrency ({}) exceeds batch_size_limit ({})",
                self.batch_concurrency,
                self.batch_size_limit
            );
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.recovery_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            jitter_fraction: self.retry_jitter_fraction,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

impl Config {
    /// Return the default provider as a strongly-typed ProviderId.
    pub fn default_provider_id(&self) -> Result<ProviderId> {
        let s = self.default_provider.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "No default provider configured.\n\
                 Hint: run `weather configure <provider>` (e.g. `weather configure openweather`) first."
            )
        })?;

        ProviderId::try_from(s.as_str())
    }

    /// Store default provider as string.
    pub fn set_default_provider(&mut self, id: ProviderId) {
        self.default_provider = Some(id.as_str().to_string());
    }

    /// Load config from disk, or return an empty default if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        if !path.exists() {
            // First run: no config file, return empty.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse and validate a config document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(contents)?;
        cfg.resilience.validate()?;
        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(&path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "weather", "weather-cli")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Convenience helper: set/replace a provider API key and optionally set default provider.
    pub fn upsert_provider_api_key(&mut self, provider_id: ProviderId, api_key: String) {
        self.providers.insert(provider_id.as_str().to_string(), ProviderConfig { api_key });

        if self.default_provider.is_none() {
            self.default_provider = Some(provider_id.to_string());
        }
    }

    /// Returns API key for a provider, if present.
    pub fn provider_api_key(&self, provider_id: ProviderId) -> Option<&str> {
        self.providers.get(provider_id.as_str()).map(|cfg| cfg.api_key.as_str())
    }

    pub fn is_provider_configured(&self, provider_id: ProviderId) -> bool {
        self.provider_api_key(provider_id).is_some()
    }
}
