//! Execution context and dependency wiring
//!
//! A [`Context`] is the per-worker root object: it owns the data store
//! configuration, the registered drivers, the cache backend, the
//! execution mode, and the pool registry, and it fronts connection
//! acquisition for callers. One context belongs to one worker
//! thread/task; [`fork`](Context::fork) derives a sibling context for
//! another worker that shares the immutable infrastructure but none of
//! the per-worker connection state.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::CacheBackend;
use crate::config::{BackendKind, DataStoreConfig};
use crate::connection::Connection;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::provider::{ConnectionProvider, HandleSource};
use crate::stats::UsageSnapshot;

/// Execution mode of the current process/task
///
/// Drives persistence defaults, unit-test isolation (no cache traffic,
/// commit as a no-op, deterministic pool slots) and whether sampled
/// statistics are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Long-lived service process; persistent connections pay off
    #[default]
    Service,
    /// Interactive or one-shot CLI invocation
    Cli,
    /// Test run; side effects are suppressed for isolation
    UnitTest,
}

impl ExecMode {
    /// Whether this is the long-lived service mode
    #[inline]
    pub const fn is_service(self) -> bool {
        matches!(self, Self::Service)
    }

    /// Whether this is an interactive/one-shot invocation
    #[inline]
    pub const fn is_cli(self) -> bool {
        matches!(self, Self::Cli)
    }

    /// Whether this is a test run
    #[inline]
    pub const fn is_unit_test(self) -> bool {
        matches!(self, Self::UnitTest)
    }

    /// Whether sampled operational statistics are emitted
    #[inline]
    pub const fn logs_stats(self) -> bool {
        matches!(self, Self::Service)
    }
}

/// Per-worker dependency root: configuration, drivers, cache backend,
/// pools, and the connection provider state.
///
/// Replaces ambient globals: everything a connection needs is looked up
/// here, and dropping the context releases whatever it still holds.
pub struct Context {
    config: Arc<DataStoreConfig>,
    drivers: HashMap<BackendKind, Arc<dyn Driver>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    mode: ExecMode,
    pools: HashMap<String, Arc<ConnectionPool>>,
    provider: ConnectionProvider,
}

impl Context {
    /// Create a context over a configuration; drivers and the cache
    /// backend are registered separately.
    pub fn new(config: DataStoreConfig, mode: ExecMode) -> Self {
        Self {
            config: Arc::new(config),
            drivers: HashMap::new(),
            cache_backend: None,
            mode,
            pools: HashMap::new(),
            provider: ConnectionProvider::new(mode),
        }
    }

    /// Register a driver under the backend kind it reports
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(driver.kind(), driver);
        self
    }

    /// Attach the remote cache backend used by result caching
    pub fn with_cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    /// Execution mode this context runs under
    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Data store configuration
    pub fn config(&self) -> &DataStoreConfig {
        &self.config
    }

    /// The registered driver for a backend kind
    pub fn driver_for(&self, kind: BackendKind) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::configuration(format!("no driver registered for {kind}")))
    }

    /// Lifetime acquire/reuse counters for this context
    pub fn stats(&self) -> UsageSnapshot {
        self.provider.stats()
    }

    /// Derive a context for another worker.
    ///
    /// Shares the configuration, drivers, cache backend, and the pools
    /// registered so far; connection handles and counters start fresh.
    /// Pools started after the fork do not propagate to existing
    /// siblings.
    pub fn fork(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            drivers: self.drivers.clone(),
            cache_backend: self.cache_backend.clone(),
            mode: self.mode,
            pools: self.pools.clone(),
            provider: ConnectionProvider::new(self.mode),
        }
    }

    /// Hand out a connection to `server`, reusing the handle this context
    /// already holds for it when there is one.
    ///
    /// A first acquisition draws from the pool registered as `"default"`
    /// when present, otherwise builds a raw connection. Interactive/CLI
    /// contexts force `persistent` off. The selected database and group
    /// are (re)applied on every call, so one handle can serve different
    /// targets on the same server over its lifetime.
    pub fn acquire(
        &mut self,
        server: &str,
        db: &str,
        group: &str,
        persistent: bool,
    ) -> Result<&mut Connection> {
        let settings = self.config.server(server)?;
        let persistent = !self.mode.is_cli() && persistent;

        let source = if self.provider.holds(server) {
            None
        } else if let Some(pool) = self.pools.get("default") {
            Some(HandleSource::Pooled(Arc::clone(pool)))
        } else {
            let driver = self.drivers.get(&settings.kind).cloned().ok_or_else(|| {
                Error::configuration(format!("no driver registered for {}", settings.kind))
            })?;
            Some(HandleSource::Raw {
                driver,
                cache_backend: self.cache_backend.clone(),
            })
        };

        self.provider.acquire(server, settings, db, group, persistent, source)
    }

    /// Give the handle held for `server` back: a pooled handle returns to
    /// its pool, a raw one is closed. Releasing a server with no held
    /// handle is a no-op.
    pub fn release_dsh(&mut self, server: &str) -> Result<()> {
        let pool = self.pools.get("default").cloned();
        self.provider.release(server, pool)
    }

    /// Open a side-band connection for work that must not join the
    /// caller's transaction.
    ///
    /// The connection is non-persistent and never cached by the context;
    /// finish it with [`autonomous_tx_stop_commit`] or
    /// [`autonomous_tx_stop_rollback`].
    ///
    /// [`autonomous_tx_stop_commit`]: crate::provider::autonomous_tx_stop_commit
    /// [`autonomous_tx_stop_rollback`]: crate::provider::autonomous_tx_stop_rollback
    pub fn autonomous_tx_start(&self, server: &str, db: &str, group: &str) -> Result<Connection> {
        let settings = self.config.server(server)?;
        let driver = self.driver_for(settings.kind)?;

        let mut conn = Connection::new(driver, self.cache_backend.clone(), self.mode);
        conn.set_persistent(false);
        conn.configure(settings, db, group)?;
        Ok(conn)
    }

    /// Start a connection pool and register it on this context.
    ///
    /// The registry key is `name`, or `"default"` when `is_default` is
    /// set; the default pool is the one [`acquire`](Self::acquire) draws
    /// from. Starting a second pool under the same key fails.
    pub fn start_pool(
        &mut self,
        name: &str,
        server: &str,
        db: &str,
        group: &str,
        size: usize,
        is_default: bool,
    ) -> Result<()> {
        let key = if is_default { "default" } else { name };
        if self.pools.contains_key(key) {
            return Err(Error::configuration(
                "cannot start connection pool because it is already running",
            ));
        }

        let settings = self.config.server(server)?;
        let driver = self.driver_for(settings.kind)?;
        let config = PoolConfig::new(key, db, group).with_size(size);
        let pool = ConnectionPool::start(
            config,
            settings,
            driver,
            self.cache_backend.clone(),
            self.mode,
        )?;

        self.pools.insert(key.to_string(), Arc::new(pool));
        Ok(())
    }

    /// Look up a registered pool by name
    pub fn pool(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.get(name).cloned()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        for server in self.provider.held_servers() {
            if let Err(err) = self.release_dsh(&server) {
                warn!(server = %server, error = %err, "failed to release connection at context teardown");
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("mode", &self.mode)
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .field("cache_backend", &self.cache_backend.is_some())
            .finish()
    }
}
