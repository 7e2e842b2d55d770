//! Driver traits for duraconn
//!
//! The seam between the connection lifecycle and a concrete database
//! backend. A [`Driver`] opens transports and describes the backend's
//! statement syntax; a [`DriverConnection`] is one open transport.
//! Driver errors carry a [`DriverErrorKind`] so the lifecycle layer can
//! separate "try the next host" failures from everything else and
//! translate constraint violations into the crate taxonomy.

use std::fmt;
use thiserror::Error;

use crate::config::BackendKind;
use crate::types::{Row, Value};

/// Result type for driver operations
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Classification of a backend failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// The host did not accept a transport connection; the caller should
    /// try the next failover candidate
    HostUnreachable,
    /// Unique/primary key violation (e.g. vendor code 1062, SQLSTATE 23505)
    DuplicateKey,
    /// Foreign key violation (e.g. vendor code 1452, SQLSTATE 23503)
    ForeignKeyViolation,
    /// Illegal mix of collations (vendor code 1271)
    CollationMix,
    /// Any other statement-level failure (syntax, missing table, ...)
    Execution,
    /// Transport or protocol failure outside statement execution
    Other,
}

/// An error raised by a concrete database driver
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
    /// Failure classification
    pub kind: DriverErrorKind,
    /// Backend-native error text
    pub message: String,
}

impl DriverError {
    /// Create a driver error
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Host refused/unreachable during connect
    pub fn host_unreachable(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::HostUnreachable, message)
    }

    /// Unique/primary key violation
    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::DuplicateKey, message)
    }

    /// Foreign key violation
    pub fn foreign_key(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::ForeignKeyViolation, message)
    }

    /// Illegal mix of collations
    pub fn collation_mix(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::CollationMix, message)
    }

    /// Statement execution failure
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Execution, message)
    }

    /// Any other transport/protocol failure
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Other, message)
    }
}

/// Everything a driver needs to open one transport
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Host name or address, optionally `host:port`
    pub host: String,
    /// Login user
    pub username: String,
    /// Login password
    pub password: String,
    /// Database to select
    pub db: String,
    /// Session character set
    pub charset: String,
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"***")
            .field("db", &self.db)
            .field("charset", &self.charset)
            .finish()
    }
}

/// Result of one executed statement at the driver level
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    /// Result rows (empty for writes)
    pub rows: Vec<Row>,
    /// Affected row count reported by the backend
    pub affected: u64,
    /// Generated key of the most recent insert, where the backend has one
    pub last_insert_id: Option<u64>,
}

/// A concrete database backend
pub trait Driver: Send + Sync {
    /// Which backend this driver speaks to
    fn kind(&self) -> BackendKind;

    /// Open a transport to the given target
    fn connect(&self, target: &ConnectTarget) -> DriverResult<Box<dyn DriverConnection>>;

    /// Bind placeholder for the 1-based parameter `index`
    fn placeholder(&self, index: usize) -> String {
        let _ = index;
        "?".to_string()
    }

    /// Statement that reports the server's configured idle timeout in
    /// seconds, for backends that have one. The result row is expected to
    /// expose the value in a column named `Value` (or as its last column).
    fn idle_timeout_probe(&self) -> Option<&'static str> {
        None
    }
}

/// One open transport to a database server
pub trait DriverConnection: Send {
    /// Execute one statement with bound parameters. `expect_rows` is the
    /// caller's read/write classification; backends that need separate
    /// query/execute paths use it, others may ignore it.
    fn execute(&mut self, sql: &str, binds: &[Value], expect_rows: bool)
    -> DriverResult<ExecOutcome>;

    /// Lightweight liveness probe
    fn ping(&mut self) -> DriverResult<()>;

    /// Commit the open transaction
    fn commit(&mut self) -> DriverResult<()>;

    /// Roll back the open transaction
    fn rollback(&mut self) -> DriverResult<()>;

    /// Close the transport
    fn close(&mut self) -> DriverResult<()>;

    /// Backend-assigned identifier of this connection (thread id,
    /// backend pid, ...)
    fn connection_id(&self) -> u64;
}
