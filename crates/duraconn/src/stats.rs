//! Usage statistics for duraconn
//!
//! Request/hit counters shared by the cache, pool, and provider layers,
//! plus a probabilistic sampler so hot paths can emit stats lines at a
//! fixed average rate instead of on every call.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// One stats line per this many connection acquisitions, on average
pub const CONNECTION_STATS_PERIOD: u32 = 50;

/// One stats line per this many cache reads, on average
pub const CACHE_STATS_PERIOD: u32 = 100_000;

/// Point-in-time view of usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// Total requests observed
    pub requests: u64,
    /// Requests satisfied without doing the expensive thing (cache hit,
    /// reused connection, ...)
    pub hits: u64,
}

impl UsageSnapshot {
    /// Hit rate in percent
    pub fn hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.requests as f64 * 100.0
        }
    }
}

/// Thread-safe usage counters
#[derive(Debug, Default)]
pub struct UsageStats {
    requests: AtomicU64,
    hits: AtomicU64,
}

impl UsageStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one hit
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero both counters
    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot
    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }
}

/// Emits `true` once per `period` calls on average.
///
/// Disabled samplers never fire, which is how non-service execution modes
/// keep stats noise out of CLI runs and unit tests.
#[derive(Debug, Clone, Copy)]
pub struct SampledLogger {
    period: u32,
    enabled: bool,
}

impl SampledLogger {
    /// Create a sampler firing once per `period` calls on average
    pub const fn new(period: u32, enabled: bool) -> Self {
        Self { period, enabled }
    }

    /// Whether the sampler can ever fire
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Roll the dice for this call
    pub fn sample(&self) -> bool {
        if !self.enabled || self.period == 0 {
            return false;
        }
        rand::thread_rng().gen_range(0..self.period) == 0
    }
}
