//! Scripted test doubles
//!
//! [`MockDriver`] speaks the [`Driver`] interface against in-memory
//! state: result sets are scripted per statement, hosts can be marked
//! unreachable to exercise failover, and every wire interaction is
//! recorded for assertions. [`MemoryCacheBackend`] is the matching
//! [`CacheBackend`] with call counters. Both compile unconditionally so
//! downstream crates can drive their own tests with them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::{CacheBackend, CacheResult};
use crate::config::BackendKind;
use crate::driver::{
    ConnectTarget, Driver, DriverConnection, DriverError, DriverResult, ExecOutcome,
};
use crate::types::{Row, Value};

struct MockState {
    unreachable: Mutex<HashSet<String>>,
    results: Mutex<HashMap<String, Vec<Row>>>,
    affected: Mutex<u64>,
    last_insert_id: Mutex<Option<u64>>,
    fail_next_execute: Mutex<Option<DriverError>>,
    ping_fail: AtomicBool,
    rollback_fail: AtomicBool,
    attempted: Mutex<Vec<ConnectTarget>>,
    executed: Mutex<Vec<(String, Vec<Value>)>>,
    connects: AtomicUsize,
    pings: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    next_id: AtomicU64,
}

impl MockState {
    fn new() -> Self {
        Self {
            unreachable: Mutex::new(HashSet::new()),
            results: Mutex::new(HashMap::new()),
            affected: Mutex::new(1),
            last_insert_id: Mutex::new(None),
            fail_next_execute: Mutex::new(None),
            ping_fail: AtomicBool::new(false),
            rollback_fail: AtomicBool::new(false),
            attempted: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }
}

/// In-memory [`Driver`] whose behavior is scripted per test.
///
/// A fresh driver mimics a healthy server: every host connects, reads
/// return their scripted rows (or nothing), writes report one affected
/// row, and the idle-timeout probe answers 28800 seconds. Clones share
/// the underlying state, so one handle scripts while another is wired
/// into the code under test.
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<MockState>,
    kind: BackendKind,
    probe: Option<&'static str>,
}

impl MockDriver {
    /// Statement the scripted idle-timeout probe answers
    pub const PROBE: &'static str = "show variables like 'wait_timeout'";

    /// A healthy scripted MySQL-flavored driver
    pub fn new() -> Self {
        Self::with_kind(BackendKind::MySql)
    }

    /// A healthy scripted driver reporting the given backend kind
    pub fn with_kind(kind: BackendKind) -> Self {
        let driver = Self {
            state: Arc::new(MockState::new()),
            kind,
            probe: Some(Self::PROBE),
        };
        driver.stage_wait_timeout(28800);
        driver
    }

    /// Drop the idle-timeout probe, like a backend with no such setting
    pub fn without_probe(mut self) -> Self {
        self.probe = None;
        self
    }

    /// Script the probe to answer `seconds`
    pub fn stage_wait_timeout(&self, seconds: u64) {
        self.stage_rows(
            Self::PROBE,
            vec![Row::new(
                vec!["Variable_name".into(), "Value".into()],
                vec![
                    Value::Text("wait_timeout".into()),
                    Value::Text(seconds.to_string()),
                ],
            )],
        );
    }

    /// Script the rows a read statement returns
    pub fn stage_rows(&self, sql: &str, rows: Vec<Row>) {
        self.state.results.lock().insert(sql.to_string(), rows);
    }

    /// Remove the script for a statement; it reads as empty again
    pub fn clear_rows(&self, sql: &str) {
        self.state.results.lock().remove(sql);
    }

    /// Affected-row count every write reports from now on
    pub fn stage_affected(&self, affected: u64) {
        *self.state.affected.lock() = affected;
    }

    /// Generated key every write reports from now on
    pub fn stage_last_insert_id(&self, id: u64) {
        *self.state.last_insert_id.lock() = Some(id);
    }

    /// Fail the next statement (a single one) with the given error
    pub fn fail_next_execute(&self, err: DriverError) {
        *self.state.fail_next_execute.lock() = Some(err);
    }

    /// Refuse transport connections to `host`
    pub fn set_unreachable(&self, host: &str) {
        self.state.unreachable.lock().insert(host.to_string());
    }

    /// Accept transport connections to `host` again
    pub fn set_reachable(&self, host: &str) {
        self.state.unreachable.lock().remove(host);
    }

    /// Make every liveness probe fail (or succeed again)
    pub fn set_ping_fail(&self, fail: bool) {
        self.state.ping_fail.store(fail, Ordering::SeqCst);
    }

    /// Make every rollback fail (or succeed again)
    pub fn set_rollback_fail(&self, fail: bool) {
        self.state.rollback_fail.store(fail, Ordering::SeqCst);
    }

    /// Successful transport connections so far
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Liveness probes attempted so far
    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Commits issued so far
    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }

    /// Rollbacks issued so far
    pub fn rollbacks(&self) -> usize {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    /// Every statement executed, with its bind values, in order
    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.state.executed.lock().clone()
    }

    /// Hosts connection attempts were made to, in order, including
    /// refused ones
    pub fn attempted_hosts(&self) -> Vec<String> {
        self.state
            .attempted
            .lock()
            .iter()
            .map(|target| target.host.clone())
            .collect()
    }

    /// The most recent connection attempt
    pub fn last_target(&self) -> Option<ConnectTarget> {
        self.state.attempted.lock().last().cloned()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MockDriver {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn connect(&self, target: &ConnectTarget) -> DriverResult<Box<dyn DriverConnection>> {
        self.state.attempted.lock().push(target.clone());

        if self.state.unreachable.lock().contains(&target.host) {
            return Err(DriverError::host_unreachable(format!(
                "cannot reach {}",
                target.host
            )));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            id,
            open: true,
        }))
    }

    fn idle_timeout_probe(&self) -> Option<&'static str> {
        self.probe
    }
}

struct MockConnection {
    state: Arc<MockState>,
    id: u64,
    open: bool,
}

impl DriverConnection for MockConnection {
    fn execute(
        &mut self,
        sql: &str,
        binds: &[Value],
        expect_rows: bool,
    ) -> DriverResult<ExecOutcome> {
        if !self.open {
            return Err(DriverError::other("connection is closed"));
        }

        self.state
            .executed
            .lock()
            .push((sql.to_string(), binds.to_vec()));

        if let Some(err) = self.state.fail_next_execute.lock().take() {
            return Err(err);
        }

        if expect_rows {
            let rows = self.state.results.lock().get(sql).cloned().unwrap_or_default();
            Ok(ExecOutcome {
                rows,
                affected: 0,
                last_insert_id: None,
            })
        } else {
            Ok(ExecOutcome {
                rows: Vec::new(),
                affected: *self.state.affected.lock(),
                last_insert_id: *self.state.last_insert_id.lock(),
            })
        }
    }

    fn ping(&mut self) -> DriverResult<()> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.ping_fail.load(Ordering::SeqCst) {
            return Err(DriverError::other("ping failed"));
        }
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.state.rollback_fail.load(Ordering::SeqCst) {
            return Err(DriverError::execution("rollback failed"));
        }
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        self.open = false;
        Ok(())
    }

    fn connection_id(&self) -> u64 {
        self.id
    }
}

/// In-memory [`CacheBackend`] with per-method call counters.
///
/// TTLs are accepted and ignored; entries live until deleted.
#[derive(Default)]
pub struct MemoryCacheBackend {
    values: Mutex<HashMap<String, Vec<u8>>>,
    gets: AtomicUsize,
    multi_gets: AtomicUsize,
    sets: AtomicUsize,
    deletes: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MemoryCacheBackend {
    /// An empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-key reads so far
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Multi-key reads so far
    pub fn multi_gets(&self) -> usize {
        self.multi_gets.load(Ordering::SeqCst)
    }

    /// Writes so far
    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    /// Deletes so far
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Disconnects so far
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Whether a key is currently stored
    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Whether the backend holds no entries
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.values.lock().get(key).cloned())
    }

    fn get_multi(&self, keys: &[&str]) -> CacheResult<HashMap<String, Vec<u8>>> {
        self.multi_gets.fetch_add(1, Ordering::SeqCst);
        let values = self.values.lock();
        Ok(keys
            .iter()
            .filter_map(|&key| values.get(key).map(|value| (key.to_string(), value.clone())))
            .collect())
    }

    fn set(&self, key: &str, value: &[u8], _ttl: Option<Duration>) -> CacheResult<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.values.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.values.lock().remove(key);
        Ok(())
    }

    fn disconnect(&self) -> CacheResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
