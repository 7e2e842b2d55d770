//! Fixed-size connection pooling
//!
//! A [`ConnectionPool`] pre-builds `size` [`Connection`]s at startup and
//! hands them out under a counting semaphore, so concurrent database
//! load never exceeds the pool capacity; callers past the limit block
//! until a slot is released. At startup the pool probes the server's
//! idle-timeout setting through one of its own connections and feeds it
//! into every slot's ping policy, so a slot that sat idle past the
//! server's deadline is reset and reconnected instead of blindly reused.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::cache::CacheBackend;
use crate::config::ServerConfig;
use crate::context::ExecMode;
use crate::connection::{Connection, IDLE_MARGIN};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::stats::{SampledLogger, UsageSnapshot, CONNECTION_STATS_PERIOD};
use crate::types::Value;

/// Warn when the server-side idle timeout is at or below this value; a
/// server that reaps connections this aggressively defeats pooling
pub const LOW_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

static POOL_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z_]+$").unwrap());

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity stamped onto a pooled connection so a release can be matched
/// back to the slot it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolTag {
    pub(crate) pool: u64,
    pub(crate) slot: usize,
}

/// Startup parameters for a [`ConnectionPool`]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name, restricted to `[a-z_]+`
    pub name: String,
    /// Database every pooled connection selects
    pub db: String,
    /// Connection group every pooled connection uses
    pub group: String,
    /// Number of pre-built connections
    pub size: usize,
    /// Bound on how long `get_dsh` waits for a free slot; `None` waits
    /// indefinitely
    pub dsh_timeout: Option<Duration>,
}

impl PoolConfig {
    /// Pool parameters with a single slot and an unbounded checkout wait
    pub fn new(name: impl Into<String>, db: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db: db.into(),
            group: group.into(),
            size: 1,
            dsh_timeout: None,
        }
    }

    /// Set the number of pooled connections
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Bound every `get_dsh` wait instead of blocking indefinitely
    pub fn with_dsh_timeout(mut self, wait: Duration) -> Self {
        self.dsh_timeout = Some(wait);
        self
    }
}

struct Slot {
    handle: Option<Connection>,
    requests: u64,
    hits: u64,
    last_released: Instant,
}

struct PoolState {
    slots: Vec<Slot>,
    available: VecDeque<usize>,
}

/// A fixed set of pre-built connections handed out under admission
/// control.
///
/// A slot is either available (in the free list) or checked out (its
/// connection moved to the caller), never both. `release_dsh` is the
/// only way back in; [`with_dsh`](Self::with_dsh) wraps the
/// checkout/release pair for callers that want the discipline enforced.
pub struct ConnectionPool {
    id: u64,
    name: String,
    size: usize,
    mode: ExecMode,
    dsh_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    state: Mutex<PoolState>,
    slot_ready: Condvar,
    sampler: SampledLogger,
}

impl ConnectionPool {
    /// Build and start a pool: validate the parameters, eagerly allocate
    /// `size` configured connections, and probe the server's idle-timeout
    /// setting when the driver has one, feeding it into every slot's ping
    /// policy.
    ///
    /// The probe checks out a connection through the normal path, so a
    /// freshly started pool has already proven it can connect.
    pub fn start(
        config: PoolConfig,
        settings: &ServerConfig,
        driver: Arc<dyn Driver>,
        cache_backend: Option<Arc<dyn CacheBackend>>,
        mode: ExecMode,
    ) -> Result<Self> {
        if !POOL_NAME.is_match(&config.name) {
            return Err(Error::configuration(format!(
                "pool name {:?} may only contain lowercase letters and underscores",
                config.name
            )));
        }
        if config.size < 1 {
            return Err(Error::configuration("size must be greater than or equal to 1"));
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);

        let mut slots = Vec::with_capacity(config.size);
        let mut available = VecDeque::with_capacity(config.size);
        for index in 0..config.size {
            let mut conn = Connection::new(Arc::clone(&driver), cache_backend.clone(), mode);
            conn.configure(settings, &config.db, &config.group)?;
            conn.set_pool_tag(Some(PoolTag { pool: id, slot: index }));
            slots.push(Slot {
                handle: Some(conn),
                requests: 0,
                hits: 0,
                last_released: Instant::now(),
            });
            available.push_back(index);
        }

        let mut pool = Self {
            id,
            name: config.name,
            size: config.size,
            mode,
            dsh_timeout: config.dsh_timeout,
            idle_timeout: None,
            state: Mutex::new(PoolState { slots, available }),
            slot_ready: Condvar::new(),
            sampler: SampledLogger::new(CONNECTION_STATS_PERIOD, mode.logs_stats()),
        };

        if let Some(probe) = driver.idle_timeout_probe() {
            let timeout = pool.probe_idle_timeout(probe)?;
            pool.idle_timeout = Some(timeout);

            let mut state = pool.state.lock();
            for slot in &mut state.slots {
                if let Some(conn) = slot.handle.as_mut() {
                    conn.set_ping_interval(timeout);
                }
            }
        }

        debug!(pool = %pool.name, size = pool.size, "connection pool started");
        Ok(pool)
    }

    /// Pool name as registered
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.size
    }

    /// Server-side idle timeout discovered at startup, if the backend
    /// reports one
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Number of slots currently available for checkout
    pub fn available(&self) -> usize {
        self.state.lock().available.len()
    }

    /// Request/hit counters per slot, indexed by slot number
    pub fn slot_usage(&self) -> Vec<UsageSnapshot> {
        self.state
            .lock()
            .slots
            .iter()
            .map(|slot| UsageSnapshot {
                requests: slot.requests,
                hits: slot.hits,
            })
            .collect()
    }

    /// Check a connection out, blocking while the pool is exhausted.
    ///
    /// The wait is unbounded unless the pool was configured with a
    /// checkout timeout. The returned connection is connected: a cold
    /// slot is dialed, a slot idle past the server's deadline is reset
    /// and redialed, and a warm slot is handed out as-is (counted as a
    /// pool hit).
    pub fn get_dsh(&self) -> Result<Connection> {
        self.checkout(self.dsh_timeout)
    }

    /// Like [`get_dsh`](Self::get_dsh) but never waits longer than `wait`
    /// for a free slot
    pub fn get_dsh_timeout(&self, wait: Duration) -> Result<Connection> {
        self.checkout(Some(wait))
    }

    /// Return a checked-out connection to its slot.
    ///
    /// Fails with [`Error::NotPooled`] when the connection did not come
    /// from this pool. Any open transaction is rolled back first (except
    /// under the unit-test execution mode); a rollback failure drops the
    /// transport but still returns the slot, so a broken transaction can
    /// never leak into the next checkout.
    pub fn release_dsh(&self, mut conn: Connection) -> Result<()> {
        let tag = match conn.pool_tag() {
            Some(tag) if tag.pool == self.id => tag,
            _ => return Err(Error::NotPooled),
        };

        if !self.mode.is_unit_test() {
            if let Err(err) = conn.rollback(true) {
                warn!(
                    pool = %self.name,
                    slot = tag.slot,
                    error = %err,
                    "rollback on release failed, dropping the transport"
                );
                conn.reset_transport();
            }
        }

        let mut state = self.state.lock();
        let slot = state
            .slots
            .get_mut(tag.slot)
            .ok_or_else(|| Error::internal("pooled connection carries an unknown slot index"))?;
        if slot.handle.is_some() {
            return Err(Error::internal("pool slot is already occupied"));
        }
        slot.last_released = Instant::now();
        slot.handle = Some(conn);
        state.available.push_back(tag.slot);
        drop(state);
        self.slot_ready.notify_one();
        Ok(())
    }

    /// Check a connection out, run `op` on it, and release it on every
    /// path.
    ///
    /// An error from `op` wins over a release error; a release error
    /// still surfaces when `op` succeeded.
    pub fn with_dsh<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.get_dsh()?;
        let outcome = op(&mut conn);
        let released = self.release_dsh(conn);
        let value = outcome?;
        released?;
        Ok(value)
    }

    fn checkout(&self, wait: Option<Duration>) -> Result<Connection> {
        let mut state = self.state.lock();

        match wait {
            Some(wait) => {
                let deadline = Instant::now() + wait;
                while state.available.is_empty() {
                    if self.slot_ready.wait_until(&mut state, deadline).timed_out() {
                        return Err(Error::pool_exhausted(
                            "no connections available; consider resizing pool",
                        ));
                    }
                }
            }
            None => {
                while state.available.is_empty() {
                    self.slot_ready.wait(&mut state);
                }
            }
        }

        let index = pop_available(&mut state.available, self.mode.is_unit_test())
            .ok_or_else(|| Error::internal("pool free list empty after wait"))?;
        let slot = state
            .slots
            .get_mut(index)
            .ok_or_else(|| Error::internal("pool free list names an unknown slot"))?;
        let mut conn = slot
            .handle
            .take()
            .ok_or_else(|| Error::internal("cannot get handle because it is already active"))?;

        slot.requests += 1;
        let warm = conn.is_connected();
        let stale = warm
            && self.idle_timeout.is_some_and(|timeout| {
                slot.last_released.elapsed() >= timeout.saturating_sub(IDLE_MARGIN)
            });
        if warm && !stale {
            slot.hits += 1;
        }

        self.maybe_log_health(&state);
        drop(state);

        let dialed = if !warm {
            conn.connect()
        } else if stale {
            conn.reset_transport();
            conn.connect()
        } else {
            Ok(())
        };

        if let Err(err) = dialed {
            let mut state = self.state.lock();
            if let Some(slot) = state.slots.get_mut(index) {
                slot.handle = Some(conn);
                slot.last_released = Instant::now();
            }
            state.available.push_front(index);
            drop(state);
            self.slot_ready.notify_one();
            return Err(err);
        }

        Ok(conn)
    }

    fn probe_idle_timeout(&self, probe: &str) -> Result<Duration> {
        let mut conn = self.get_dsh()?;
        let probed = conn.one(probe, &[]);
        let released = self.release_dsh(conn);
        let record = probed?;
        released?;

        record
            .as_ref()
            .and_then(|row| row.get_by_name("Value"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .ok_or_else(|| Error::configuration("cannot determine server wait timeout"))
    }

    fn maybe_log_health(&self, state: &PoolState) {
        if !self.sampler.sample() {
            return;
        }

        let mut requests = 0u64;
        let mut hits = 0u64;
        for (index, slot) in state.slots.iter().enumerate() {
            requests += slot.requests;
            hits += slot.hits;
            debug!(
                pool = %self.name,
                slot = index,
                requests = slot.requests,
                hits = slot.hits,
                "pool slot usage"
            );
        }

        let hit_rate = if requests > 0 {
            (hits as f64 / requests as f64) * 100.0
        } else {
            0.0
        };
        info!(pool = %self.name, requests, hits, hit_rate, "connection pool usage");

        if let Some(timeout) = self.idle_timeout {
            if timeout <= LOW_IDLE_TIMEOUT {
                warn!(
                    pool = %self.name,
                    timeout_secs = timeout.as_secs(),
                    "server idle timeout is low; pooled connections will reset frequently"
                );
            }
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("idle_timeout", &self.idle_timeout)
            .field("available", &self.available())
            .finish()
    }
}

/// Pick the next slot index: the lowest index under the unit-test mode
/// so checkout order is deterministic, FIFO otherwise
fn pop_available(available: &mut VecDeque<usize>, deterministic: bool) -> Option<usize> {
    if deterministic {
        let position = available
            .iter()
            .enumerate()
            .min_by_key(|(_, index)| **index)
            .map(|(position, _)| position)?;
        available.remove(position)
    } else {
        available.pop_front()
    }
}
