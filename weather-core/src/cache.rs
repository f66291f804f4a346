//! TTL cache for weather snapshots.
//!
//! Expiry is evaluated lazily on read; nothing sweeps entries in the
//! background. An expired entry is a miss for [`CacheStore::get`] but stays
//! reachable through [`CacheStore::get_stale`] until it is overwritten.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{Clock, to_time_delta};
use crate::model::WeatherSnapshot;

/// Normalized city identifier: trimmed, inner whitespace collapsed, lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Returns `None` for input that is blank after trimming.
    pub fn normalize(raw: &str) -> Option<Self> {
        let words: Vec<&str> = raw.split_whitespace().collect();
        if words.is_empty() {
            return None;
        }
        Some(Self(words.join(" ").to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: WeatherSnapshot,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// A hit iff `now < expires_at`; an entry at exactly `expires_at` is expired.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Key/value store with per-entry expiry. Keys arrive already normalized.
#[async_trait]
pub trait CacheStore: Send + Sync + Debug {
    /// Fresh entries only.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Any entry for the key, expired or not.
    async fn get_stale(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Always overwrites.
    async fn put(
        &self,
        key: &CacheKey,
        value: WeatherSnapshot,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Number of entries held, fresh or stale.
    async fn entry_count(&self) -> Result<usize, CacheError>;
}

/// Process-local [`CacheStore`]. Entries are replaced as a whole under a
/// write lock, so readers never observe a partially updated entry.
#[derive(Debug)]
pub struct InMemoryCacheStore {
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl InMemoryCacheStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, entries: RwLock::new(HashMap::new()) }
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let now = self.clock.now();
        let entry = self.entries.read().get(key).cloned();

        match entry {
            Some(entry) if entry.is_fresh(now) => {
                tracing::debug!(%key, "cache hit");
                Ok(Some(entry))
            }
            Some(_) => {
                tracing::debug!(%key, "cache entry expired");
                Ok(None)
            }
            None => {
                tracing::debug!(%key, "cache miss");
                Ok(None)
            }
        }
    }

    async fn get_stale(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(
        &self,
        key: &CacheKey,
        value: WeatherSnapshot,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(to_time_delta(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = CacheEntry { key: key.clone(), value, expires_at };

        self.entries.write().insert(key.clone(), entry);
        tracing::debug!(%key, %expires_at, "cached weather snapshot");
        Ok(())
    }

    async fn entry_count(&self) -> Result<usize, CacheError> {
        Ok(self.entries.read().len())
    }
}
