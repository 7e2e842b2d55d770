//! Connection lifecycle for duraconn
//!
//! A [`Connection`] wraps one physical database transport and owns the
//! full lifecycle around it: configuration, failover-driven connect,
//! idle ping/reconnect, statement execution with error translation,
//! transaction control, and coordination with the result cache.
//!
//! The state machine runs `Unconfigured -> Configured -> Connected`,
//! with connected handles cycling between idle and active. `close()`
//! tears the transport down only for non-persistent connections;
//! persistent ones stay warm and are revalidated by the ping policy on
//! their next use.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, warn};

use crate::cache::{CacheBackend, CacheDirective, ResultCache};
use crate::config::ServerConfig;
use crate::context::ExecMode;
use crate::driver::{
    ConnectTarget, Driver, DriverConnection, DriverError, DriverErrorKind, ExecOutcome,
};
use crate::durability::selector_for;
use crate::error::{Error, Result};
use crate::pool::PoolTag;
use crate::stats::{UsageSnapshot, UsageStats};
use crate::types::{QueryOutcome, Row, Value};

/// Ping a persistent connection after this much idle time by default
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(300);

/// Safety margin subtracted from idle deadlines so a probe lands before
/// the server's own timeout fires
pub(crate) const IDLE_MARGIN: Duration = Duration::from_secs(3);

static READ_STATEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\(?select |^show ").unwrap());

/// Whether a statement is a read (`select`/`show`, optionally
/// parenthesis-wrapped) as opposed to a write
pub(crate) fn is_read_statement(sql: &str) -> bool {
    READ_STATEMENT.is_match(sql)
}

/// One managed link to a relational database server.
///
/// Built by a [`Context`](crate::context::Context) or a
/// [`ConnectionPool`](crate::pool::ConnectionPool); direct construction
/// is the seam for tests and embedders that bring their own [`Driver`].
pub struct Connection {
    driver: Arc<dyn Driver>,
    cache: ResultCache,
    mode: ExecMode,
    settings: Option<ServerConfig>,
    db: Option<String>,
    group: Option<String>,
    charset: String,
    persistent: bool,
    ping_interval: Duration,
    inactive_since: Instant,
    handle: Option<Box<dyn DriverConnection>>,
    pending_cache: Option<CacheDirective>,
    row_count: Option<u64>,
    last_insert_id: Option<u64>,
    stats: UsageStats,
    pool_tag: Option<PoolTag>,
}

impl Connection {
    /// Create an unconfigured connection over a driver and an optional
    /// cache backend.
    ///
    /// Connections default to persistent except in the CLI execution
    /// mode, where a one-shot process gains nothing from keeping a
    /// transport warm.
    pub fn new(
        driver: Arc<dyn Driver>,
        cache_backend: Option<Arc<dyn CacheBackend>>,
        mode: ExecMode,
    ) -> Self {
        Self {
            driver,
            cache: ResultCache::new(cache_backend, mode),
            mode,
            settings: None,
            db: None,
            group: None,
            charset: "utf8".to_string(),
            persistent: !mode.is_cli(),
            ping_interval: DEFAULT_PING_INTERVAL,
            inactive_since: Instant::now(),
            handle: None,
            pending_cache: None,
            row_count: None,
            last_insert_id: None,
            stats: UsageStats::new(),
            pool_tag: None,
        }
    }

    /// Mark this connection reusable across logical operations (or not)
    pub fn set_persistent(&mut self, persistent: bool) -> &mut Self {
        self.persistent = persistent;
        self
    }

    /// Set the session character set used at connect time
    pub fn set_charset(&mut self, charset: impl Into<String>) -> &mut Self {
        self.charset = charset.into();
        self
    }

    /// Override the idle interval after which a liveness probe is due
    pub fn set_ping_interval(&mut self, interval: Duration) -> &mut Self {
        self.ping_interval = interval;
        self
    }

    /// Whether this connection survives `close()`
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Whether a transport handle is currently open
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Selected database name, once configured
    pub fn db(&self) -> Option<&str> {
        self.db.as_deref()
    }

    /// Selected connection group, once configured
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Row count reported by the most recent statement
    pub fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    /// Generated key of the most recent insert observed by `query()`
    pub fn last_insert_id(&self) -> Option<u64> {
        self.last_insert_id
    }

    /// Lifetime request/hit counters for this connection
    pub fn stats(&self) -> UsageSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn pool_tag(&self) -> Option<PoolTag> {
        self.pool_tag
    }

    pub(crate) fn set_pool_tag(&mut self, tag: Option<PoolTag>) {
        self.pool_tag = tag;
    }

    /// Select the server settings, database, and connection group.
    ///
    /// Fails if `group` is not configured for the server. Re-configuring
    /// to a different target closes out the current state and drops the
    /// transport so the next use reconnects; re-asserting the current
    /// target leaves a warm transport in place.
    pub fn configure(
        &mut self,
        settings: &ServerConfig,
        db: impl Into<String>,
        group: impl Into<String>,
    ) -> Result<&mut Self> {
        let db = db.into();
        let group = group.into();
        settings.group(&group)?;

        let unchanged = self.settings.as_ref() == Some(settings)
            && self.db.as_deref() == Some(db.as_str())
            && self.group.as_deref() == Some(group.as_str());

        self.close();
        if !unchanged {
            self.reset_transport();
        }

        self.settings = Some(settings.clone());
        self.db = Some(db);
        self.group = Some(group);
        Ok(self)
    }

    /// Ensure a live transport, connecting or reconnecting as needed.
    ///
    /// With a handle already open this is a cheap revalidation: a ping is
    /// sent only when the idle deadline is near, and a failed ping tears
    /// the transport down and reconnects through the durability loop.
    /// A fresh connect walks the group's host list in selector order,
    /// retrying only on host-unreachable failures; any other error
    /// propagates immediately.
    pub fn connect(&mut self) -> Result<()> {
        if self.persistent {
            self.stats.record_request();
        }

        if self.handle.is_some() {
            if self.should_ping() {
                let alive = self.handle.as_mut().is_some_and(|h| h.ping().is_ok());
                if alive {
                    return Ok(());
                }
                debug!("liveness probe failed, reconnecting");
                self.reset_transport();
            } else {
                if self.persistent {
                    self.stats.record_hit();
                }
                return Ok(());
            }
        }

        let (settings, db, group) = match (&self.settings, &self.db, &self.group) {
            (Some(settings), Some(db), Some(group)) => (settings, db.clone(), group.as_str()),
            _ => {
                return Err(Error::configuration(format!(
                    "cannot connect to {} because the data store has not been configured",
                    self.driver.kind()
                )));
            }
        };

        // The group was validated in configure(), so the lookup holds here.
        let mut selector = selector_for(settings.group(group)?)?;

        let handle = loop {
            let host = selector.next()?;
            let target = ConnectTarget {
                host: host.host.clone(),
                username: host.username.clone(),
                password: host.password.clone(),
                db: db.clone(),
                charset: self.charset.clone(),
            };
            match self.driver.connect(&target) {
                Ok(handle) => break handle,
                Err(err) if err.kind == DriverErrorKind::HostUnreachable => {
                    warn!(host = %host.host, error = %err, "host unreachable, trying next candidate");
                }
                Err(err) => return Err(Error::connection(err.message)),
            }
        };

        self.handle = Some(handle);
        self.inactive_since = Instant::now();
        Ok(())
    }

    /// Backend-assigned identifier of the underlying transport
    pub fn connection_id(&mut self) -> Result<u64> {
        self.connect()?;
        Ok(self.live_handle()?.connection_id())
    }

    /// Attach a single-use cache directive to the next `query()` call
    pub fn memcache(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.pending_cache = Some(CacheDirective::new(key, ttl));
        self
    }

    /// Like [`memcache`](Self::memcache) but the cached entry never expires
    pub fn memcache_keep(&mut self, key: impl Into<String>) -> &mut Self {
        self.pending_cache = Some(CacheDirective::keep(key));
        self
    }

    /// Execute a statement with bound parameters.
    ///
    /// Reads return their rows (an empty result is an empty list); writes
    /// return [`QueryOutcome::Write`]. When a cache directive is pending,
    /// a cached result short-circuits the wire entirely; the directive is
    /// consumed by this call either way.
    pub fn query(&mut self, sql: &str, binds: &[Value]) -> Result<QueryOutcome> {
        let directive = self.pending_cache.take();

        if let Some(directive) = &directive {
            if let Some(rows) = self.cache.retrieve(&directive.key) {
                return Ok(QueryOutcome::Rows(rows));
            }
        }

        let expect_rows = is_read_statement(sql);
        let outcome = self.execute_wire(sql, binds, expect_rows)?;
        self.last_insert_id = outcome.last_insert_id;

        if expect_rows {
            let rows = outcome.rows;
            self.row_count = Some(rows.len() as u64);
            if let Some(directive) = &directive {
                self.cache.store(&directive.key, &rows, directive.ttl, directive.ttl);
            }
            Ok(QueryOutcome::Rows(rows))
        } else {
            self.row_count = Some(outcome.affected);
            Ok(QueryOutcome::Write)
        }
    }

    /// Fetch several cached result sets at once, bypassing the wire.
    ///
    /// Purely a cache read; keys with no cached value are omitted.
    pub fn retrieve_multi(
        &mut self,
        keys: &[&str],
    ) -> std::collections::HashMap<String, Vec<Row>> {
        self.cache.retrieve_multi(keys)
    }

    /// Insert one row built from column/value pairs.
    ///
    /// A value recognized as a server-side time keyword
    /// (`current_timestamp`, `current_date`) is inlined into the SQL
    /// rather than bound. Returns the generated row id when requested and
    /// available; an empty field list returns `None` without touching the
    /// wire.
    pub fn create(
        &mut self,
        table: &str,
        fields: &[(&str, Value)],
        return_insert_id: bool,
    ) -> Result<Option<u64>> {
        if fields.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(fields.len());
        let mut markers = Vec::with_capacity(fields.len());
        let mut binds = Vec::new();
        for (column, value) in fields {
            columns.push(*column);
            match value.as_sql_keyword() {
                Some(keyword) => markers.push(keyword.to_string()),
                None => {
                    binds.push(value.clone());
                    markers.push(self.driver.placeholder(binds.len()));
                }
            }
        }

        let sql = format!(
            "insert into {}({}) values ({})",
            table,
            columns.join(", "),
            markers.join(", ")
        );

        let outcome = self.execute_wire(&sql, &binds, false)?;
        self.row_count = Some(outcome.affected);

        Ok(if return_insert_id {
            outcome.last_insert_id
        } else {
            None
        })
    }

    /// Delete rows matching the column/value pairs; an empty filter
    /// deletes every row in the table.
    ///
    /// A pending cache directive is purged after a successful delete and
    /// consumed regardless of the outcome.
    pub fn delete(&mut self, table: &str, where_fields: &[(&str, Value)]) -> Result<bool> {
        let mut sql = format!("delete from {table}");
        let mut binds = Vec::new();

        if !where_fields.is_empty() {
            let mut clauses = Vec::with_capacity(where_fields.len());
            for (column, value) in where_fields {
                match value.as_sql_keyword() {
                    Some(keyword) => clauses.push(format!("{column} = {keyword}")),
                    None => {
                        binds.push(value.clone());
                        clauses.push(format!("{column} = {}", self.driver.placeholder(binds.len())));
                    }
                }
            }
            sql.push_str(" where ");
            sql.push_str(&clauses.join(" and "));
        }

        let outcome = match self.execute_wire(&sql, &binds, false) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.pending_cache = None;
                return Err(err);
            }
        };
        self.row_count = Some(outcome.affected);

        if let Some(directive) = self.pending_cache.take() {
            self.cache.purge(&directive.key);
        }

        Ok(true)
    }

    /// Run a read and return the row at `index`, if the result reaches
    /// that far
    pub fn nth(&mut self, index: usize, sql: &str, binds: &[Value]) -> Result<Option<Row>> {
        let outcome = self.query(sql, binds)?;
        Ok(outcome.into_rows().into_iter().nth(index))
    }

    /// Run a read and return its first row, if any
    pub fn one(&mut self, sql: &str, binds: &[Value]) -> Result<Option<Row>> {
        self.nth(0, sql, binds)
    }

    /// Run an aggregate query and return the first column of the first
    /// row as an integer
    pub fn count(&mut self, sql: &str, binds: &[Value]) -> Result<Option<i64>> {
        let record = self.nth(0, sql, binds)?;
        Ok(record.and_then(|row| row.values().first().and_then(|value| value.as_i64())))
    }

    /// Commit the open transaction.
    ///
    /// Fails if no connection was ever established, unless `ignore_errors`
    /// suppresses exactly that case. Under the unit-test execution mode
    /// this is a no-op so test cases never persist across each other.
    pub fn commit(&mut self, ignore_errors: bool) -> Result<()> {
        if self.handle.is_none() {
            if ignore_errors {
                return Ok(());
            }
            return Err(Error::not_connected("committed"));
        }

        if self.mode.is_unit_test() {
            return Ok(());
        }

        self.connect()?;
        self.live_handle()?
            .commit()
            .map_err(|err| Error::connection(err.message))
    }

    /// Roll back the open transaction.
    ///
    /// Fails if no connection was ever established, unless `ignore_errors`
    /// suppresses exactly that case. Unlike `commit`, a rollback executes
    /// in every execution mode.
    pub fn rollback(&mut self, ignore_errors: bool) -> Result<()> {
        if self.handle.is_none() {
            if ignore_errors {
                return Ok(());
            }
            return Err(Error::not_connected("rolled back"));
        }

        self.connect()?;
        self.live_handle()?
            .rollback()
            .map_err(|err| Error::connection(err.message))
    }

    /// Finish a logical use of this connection.
    ///
    /// Clears the local cache tier and marks the connection idle. Only
    /// non-persistent connections also tear down the transport and the
    /// cache backend link; persistent ones come back from `close()`
    /// ready for reuse.
    pub fn close(&mut self) {
        self.inactive_since = Instant::now();
        self.cache.clear_local();

        if !self.persistent {
            self.reset_transport();
            self.cache.disconnect();
        }
    }

    /// Drop the transport handle outright, regardless of persistence.
    ///
    /// The next `connect()` establishes a fresh transport through the
    /// durability loop.
    pub fn reset_transport(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(err) = handle.close() {
                debug!(error = %err, "transport close reported an error");
            }
        }
    }

    fn should_ping(&mut self) -> bool {
        if !self.persistent {
            return false;
        }

        let due =
            self.inactive_since.elapsed() >= self.ping_interval.saturating_sub(IDLE_MARGIN);
        self.inactive_since = Instant::now();
        due
    }

    fn live_handle(&mut self) -> Result<&mut dyn DriverConnection> {
        match self.handle.as_deref_mut() {
            Some(handle) => Ok(handle),
            None => Err(Error::internal("no transport handle after connect")),
        }
    }

    fn execute_wire(&mut self, sql: &str, binds: &[Value], expect_rows: bool) -> Result<ExecOutcome> {
        self.connect()?;
        self.live_handle()?
            .execute(sql, binds, expect_rows)
            .map_err(|err| translate_exec_error(err, sql, binds))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("db", &self.db)
            .field("group", &self.group)
            .field("charset", &self.charset)
            .field("persistent", &self.persistent)
            .field("connected", &self.handle.is_some())
            .field("pool_tag", &self.pool_tag)
            .finish()
    }
}

fn translate_exec_error(err: DriverError, sql: &str, binds: &[Value]) -> Error {
    match err.kind {
        DriverErrorKind::DuplicateKey => Error::duplicate_key(err.message),
        DriverErrorKind::ForeignKeyViolation => Error::foreign_key(err.message),
        DriverErrorKind::CollationMix => Error::collation_mix(sql, binds, err.message),
        DriverErrorKind::Execution => Error::query_execution(sql, binds, err.message),
        DriverErrorKind::HostUnreachable | DriverErrorKind::Other => {
            Error::connection(err.message)
        }
    }
}
