//! Connection acquisition for one execution context
//!
//! A [`ConnectionProvider`] caches one [`Connection`] per server name
//! for the lifetime of its context: the first acquisition builds the
//! handle (drawing from the default pool when one is registered), every
//! later acquisition reuses it, and release either returns it to its
//! pool or closes it. Autonomous transactions sidestep the cache
//! entirely for side-band writes that must not join the caller's
//! transaction.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::cache::CacheBackend;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::context::ExecMode;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::stats::{SampledLogger, UsageSnapshot, UsageStats, CONNECTION_STATS_PERIOD};

/// Where a first-time handle for a server comes from
pub(crate) enum HandleSource {
    /// Check out of the pool registered as the default
    Pooled(Arc<ConnectionPool>),
    /// Build a raw connection over the given driver
    Raw {
        driver: Arc<dyn Driver>,
        cache_backend: Option<Arc<dyn CacheBackend>>,
    },
}

/// Per-context connection accessor: one cached handle per server name,
/// built on first use and reused until released
pub struct ConnectionProvider {
    mode: ExecMode,
    handles: HashMap<String, Connection>,
    stats: UsageStats,
    sampler: SampledLogger,
}

impl ConnectionProvider {
    /// Provider with no handles yet
    pub fn new(mode: ExecMode) -> Self {
        Self {
            mode,
            handles: HashMap::new(),
            stats: UsageStats::new(),
            sampler: SampledLogger::new(CONNECTION_STATS_PERIOD, mode.logs_stats()),
        }
    }

    /// Lifetime acquire/reuse counters
    pub fn stats(&self) -> UsageSnapshot {
        self.stats.snapshot()
    }

    /// Number of handles currently held
    pub fn held(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn holds(&self, server: &str) -> bool {
        self.handles.contains_key(server)
    }

    pub(crate) fn held_servers(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub(crate) fn acquire(
        &mut self,
        server: &str,
        settings: &ServerConfig,
        db: &str,
        group: &str,
        persistent: bool,
        source: Option<HandleSource>,
    ) -> Result<&mut Connection> {
        self.stats.record_request();

        if self.handles.contains_key(server) {
            self.stats.record_hit();
        } else {
            let conn = match source {
                Some(HandleSource::Pooled(pool)) => pool.get_dsh()?,
                Some(HandleSource::Raw {
                    driver,
                    cache_backend,
                }) => {
                    let mut conn = Connection::new(driver, cache_backend, self.mode);
                    conn.set_persistent(persistent);
                    conn
                }
                None => return Err(Error::internal("no handle source for a first acquisition")),
            };
            self.handles.insert(server.to_string(), conn);
        }

        self.maybe_log_stats();

        let conn = self
            .handles
            .get_mut(server)
            .ok_or_else(|| Error::internal("connection handle vanished during acquire"))?;
        conn.configure(settings, db, group)?;
        Ok(conn)
    }

    pub(crate) fn release(
        &mut self,
        server: &str,
        pool: Option<Arc<ConnectionPool>>,
    ) -> Result<()> {
        let Some(mut conn) = self.handles.remove(server) else {
            return Ok(());
        };

        if conn.pool_tag().is_some() {
            match pool {
                Some(pool) => pool.release_dsh(conn),
                None => Err(Error::internal(
                    "pooled connection held without a registered default pool",
                )),
            }
        } else {
            conn.close();
            Ok(())
        }
    }

    fn maybe_log_stats(&self) {
        if self.sampler.sample() {
            let snapshot = self.stats.snapshot();
            info!(
                requests = snapshot.requests,
                hits = snapshot.hits,
                hit_rate = snapshot.hit_rate(),
                "connection handle usage"
            );
        }
    }
}

impl std::fmt::Debug for ConnectionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProvider")
            .field("mode", &self.mode)
            .field("held", &self.handles.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Commit and close an autonomous-transaction connection.
///
/// The connection is closed even when the commit fails; the commit
/// error is what the caller sees.
pub fn autonomous_tx_stop_commit(mut conn: Connection, ignore_errors: bool) -> Result<()> {
    let outcome = conn.commit(ignore_errors);
    conn.close();
    outcome
}

/// Roll back and close an autonomous-transaction connection.
///
/// The connection is closed even when the rollback fails; the rollback
/// error is what the caller sees.
pub fn autonomous_tx_stop_rollback(mut conn: Connection, ignore_errors: bool) -> Result<()> {
    let outcome = conn.rollback(ignore_errors);
    conn.close();
    outcome
}
