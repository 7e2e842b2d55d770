//! Two-tier query result cache for duraconn
//!
//! Tier 1 is a per-context in-memory snapshot map that answers repeated
//! reads within the same request without a network round trip. Tier 2 is
//! a remote key-value backend reached through the [`CacheBackend`] trait.
//! Backend failures are absorbed and reported as misses so a degraded
//! cache never takes query traffic down with it.
//!
//! Under the unit-test execution mode the cache goes silent: no reads,
//! no writes, no purges. Test cases never observe each other's results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::context::ExecMode;
use crate::stats::{CACHE_STATS_PERIOD, SampledLogger, UsageSnapshot, UsageStats};
use crate::types::Row;

/// Result type for cache backend operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// An error raised by a remote cache backend
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CacheError {
    /// Backend-native error text
    pub message: String,
}

impl CacheError {
    /// Create a cache backend error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A remote key-value cache backend (tier 2)
pub trait CacheBackend: Send + Sync {
    /// Fetch the bytes stored at `key`, if any
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Fetch the bytes stored at each of `keys`; absent keys are omitted
    fn get_multi(&self, keys: &[&str]) -> CacheResult<HashMap<String, Vec<u8>>>;

    /// Store `value` at `key`; `ttl` of `None` means no expiry
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()>;

    /// Remove the value stored at `key`
    fn delete(&self, key: &str) -> CacheResult<()>;

    /// Tear down any open transport to the backend
    fn disconnect(&self) -> CacheResult<()>;
}

/// Single-use cache instruction for the next query.
///
/// Attached to a connection via `memcache(key, ttl)` and consumed by the
/// very next query, hit or miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirective {
    /// Caller-supplied cache key
    pub key: String,
    /// Remote TTL; `None` means no expiry
    pub ttl: Option<Duration>,
}

impl CacheDirective {
    /// Create a directive with a TTL
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl: Some(ttl),
        }
    }

    /// Create a directive whose entry never expires
    pub fn keep(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ttl: None,
        }
    }
}

struct LocalEntry {
    rows: Vec<Row>,
    created: Instant,
    ttl: Option<Duration>,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.duration_since(self.created) >= ttl)
    }
}

/// Two-tier result cache owned by one execution context.
///
/// Not shared across threads; each context builds its own over a shared
/// backend handle.
pub struct ResultCache {
    backend: Option<Arc<dyn CacheBackend>>,
    mode: ExecMode,
    local: HashMap<String, LocalEntry>,
    stats: UsageStats,
    sampler: SampledLogger,
}

impl ResultCache {
    /// Create a cache over an optional remote backend.
    ///
    /// With no backend only the local tier operates, which still spares
    /// repeated reads within one context.
    pub fn new(backend: Option<Arc<dyn CacheBackend>>, mode: ExecMode) -> Self {
        Self {
            backend,
            mode,
            local: HashMap::new(),
            stats: UsageStats::new(),
            sampler: SampledLogger::new(CACHE_STATS_PERIOD, mode.logs_stats()),
        }
    }

    /// Whether a remote backend is attached
    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Point-in-time request/hit counters
    pub fn stats(&self) -> UsageSnapshot {
        self.stats.snapshot()
    }

    /// Look up `key`, local tier first.
    ///
    /// Returns a defensive copy of the rows; callers may mutate the result
    /// without corrupting the cached value.
    pub fn retrieve(&mut self, key: &str) -> Option<Vec<Row>> {
        if self.mode.is_unit_test() {
            return None;
        }

        self.stats.record_request();
        self.maybe_log_stats();

        let now = Instant::now();
        if let Some(entry) = self.local.get(key) {
            if entry.is_expired(now) {
                self.local.remove(key);
            } else {
                self.stats.record_hit();
                return Some(entry.rows.clone());
            }
        }

        let rows = self.backend_get(key)?;
        self.local.insert(
            key.to_string(),
            LocalEntry {
                rows: rows.clone(),
                created: now,
                ttl: None,
            },
        );
        Some(rows)
    }

    /// Look up several keys at once; absent keys are omitted from the map
    pub fn retrieve_multi(&mut self, keys: &[&str]) -> HashMap<String, Vec<Row>> {
        if self.mode.is_unit_test() {
            return HashMap::new();
        }

        let now = Instant::now();
        let mut found = HashMap::new();
        let mut missing = Vec::new();

        for &key in keys {
            self.stats.record_request();
            let local_hit = match self.local.get(key) {
                Some(entry) if !entry.is_expired(now) => Some(entry.rows.clone()),
                Some(_) => {
                    self.local.remove(key);
                    None
                }
                None => None,
            };
            match local_hit {
                Some(rows) => {
                    self.stats.record_hit();
                    found.insert(key.to_string(), rows);
                }
                None => missing.push(key),
            }
        }

        if !missing.is_empty() {
            if let Some(backend) = &self.backend {
                match backend.get_multi(&missing) {
                    Ok(values) => {
                        for (key, bytes) in values {
                            if let Some(rows) = decode_rows(&key, &bytes) {
                                self.local.insert(
                                    key.clone(),
                                    LocalEntry {
                                        rows: rows.clone(),
                                        created: now,
                                        ttl: None,
                                    },
                                );
                                found.insert(key, rows);
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "cache backend multi-read failed");
                    }
                }
            }
        }

        found
    }

    /// Store rows under `key`: write through to the backend, then populate
    /// the local tier with its own (possibly shorter) TTL
    pub fn store(
        &mut self,
        key: &str,
        rows: &[Row],
        ttl: Option<Duration>,
        local_ttl: Option<Duration>,
    ) {
        if self.mode.is_unit_test() {
            return;
        }

        if let Some(backend) = &self.backend {
            match serde_json::to_vec(rows) {
                Ok(bytes) => {
                    if let Err(err) = backend.set(key, &bytes, ttl) {
                        warn!(error = %err, key, "cache backend write failed");
                    }
                }
                Err(err) => {
                    warn!(error = %err, key, "result rows did not serialize for caching");
                }
            }
        }

        self.local.insert(
            key.to_string(),
            LocalEntry {
                rows: rows.to_vec(),
                created: Instant::now(),
                ttl: local_ttl,
            },
        );
    }

    /// Remove `key` from both tiers
    pub fn purge(&mut self, key: &str) {
        if self.mode.is_unit_test() {
            return;
        }

        self.local.remove(key);
        if let Some(backend) = &self.backend {
            if let Err(err) = backend.delete(key) {
                warn!(error = %err, key, "cache backend delete failed");
            }
        }
    }

    /// Drop every local-tier entry; the remote tier is untouched
    pub fn clear_local(&mut self) {
        self.local.clear();
    }

    /// Close the backend transport and drop the local tier.
    ///
    /// The backend handle itself stays attached; implementations are
    /// expected to reconnect transparently on the next use.
    pub fn disconnect(&mut self) {
        self.local.clear();
        if let Some(backend) = &self.backend {
            if let Err(err) = backend.disconnect() {
                warn!(error = %err, "cache backend disconnect failed");
            }
        }
    }

    fn backend_get(&self, key: &str) -> Option<Vec<Row>> {
        let backend = self.backend.as_ref()?;
        match backend.get(key) {
            Ok(Some(bytes)) => decode_rows(key, &bytes),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, key, "cache backend read failed");
                None
            }
        }
    }

    fn maybe_log_stats(&self) {
        if self.sampler.sample() {
            let snapshot = self.stats.snapshot();
            info!(
                requests = snapshot.requests,
                hits = snapshot.hits,
                hit_rate = snapshot.hit_rate(),
                "result cache usage"
            );
        }
    }
}

fn decode_rows(key: &str, bytes: &[u8]) -> Option<Vec<Row>> {
    match serde_json::from_slice(bytes) {
        Ok(rows) => Some(rows),
        Err(err) => {
            warn!(error = %err, key, "cached value did not decode, treating as miss");
            None
        }
    }
}
