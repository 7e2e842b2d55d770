//! Error types for duraconn
//!
//! The taxonomy separates the failures callers react to differently:
//! - Host-selection exhaustion (all failover candidates tried)
//! - Constraint violations (duplicate key, foreign key, collation mix)
//! - Query execution failures carrying the offending SQL and binds
//! - Pool misuse (exhaustion, foreign release)

use std::fmt;
use thiserror::Error;

use crate::types::Value;

/// Result type for duraconn operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid or incomplete configuration
    Configuration,
    /// Host selection / failover errors
    Hosts,
    /// Transport-level connection errors
    Connection,
    /// Transaction control errors
    Transaction,
    /// Constraint violation (not retriable)
    Constraint,
    /// Query execution errors
    Query,
    /// Pool admission and release errors
    Pool,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category indicate a violated database constraint
    #[inline]
    pub const fn is_constraint(self) -> bool {
        matches!(self, Self::Constraint)
    }
}

/// Main error type for duraconn
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Invalid or incomplete configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Every failover candidate was tried
    #[error("no more hosts remain")]
    NoHostsRemain,

    /// Transaction control was attempted before any connect
    #[error(
        "transaction cannot be {operation} because a database connection has not been established yet"
    )]
    NotConnected { operation: &'static str },

    /// Transport-level connection failure
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Unique/primary key violation
    #[error("duplicate key: {message}")]
    DuplicateKey { message: String },

    /// Foreign key violation
    #[error("foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// Illegal mix of collations; carries the statement for diagnosis
    #[error(
        "illegal mix of collations in this query:\n\n{sql}\n\n{binds:?}\n\nproduced this error:\n\n{message}"
    )]
    IllegalCollationMix {
        sql: String,
        binds: Vec<Value>,
        message: String,
    },

    /// Any other backend execution failure; carries the statement for diagnosis
    #[error("execution of this query:\n\n{sql}\n\n{binds:?}\n\nproduced this error:\n\n{message}")]
    QueryExecution {
        sql: String,
        binds: Vec<Value>,
        message: String,
    },

    /// No pooled connection became available
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// The connection being released was not checked out from this pool
    #[error("connection was not properly retrieved from pool")]
    NotPooled,

    /// Invariant violation inside the library
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::NoHostsRemain => ErrorCategory::Hosts,
            Self::NotConnected { .. } => ErrorCategory::Transaction,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::DuplicateKey { .. }
            | Self::ForeignKeyViolation { .. }
            | Self::IllegalCollationMix { .. } => ErrorCategory::Constraint,
            Self::QueryExecution { .. } => ErrorCategory::Query,
            Self::PoolExhausted { .. } | Self::NotPooled => ErrorCategory::Pool,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is a database constraint violation
    #[inline]
    pub fn is_constraint(&self) -> bool {
        self.category().is_constraint()
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a commit/rollback-before-connect error
    pub fn not_connected(operation: &'static str) -> Self {
        Self::NotConnected { operation }
    }

    /// Create a duplicate key error
    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Self::DuplicateKey {
            message: message.into(),
        }
    }

    /// Create a foreign key violation error
    pub fn foreign_key(message: impl Into<String>) -> Self {
        Self::ForeignKeyViolation {
            message: message.into(),
        }
    }

    /// Create a query execution error carrying the statement and binds
    pub fn query_execution(
        sql: impl Into<String>,
        binds: &[Value],
        message: impl Into<String>,
    ) -> Self {
        Self::QueryExecution {
            sql: sql.into(),
            binds: binds.to_vec(),
            message: message.into(),
        }
    }

    /// Create a collation mix error carrying the statement and binds
    pub fn collation_mix(
        sql: impl Into<String>,
        binds: &[Value],
        message: impl Into<String>,
    ) -> Self {
        Self::IllegalCollationMix {
            sql: sql.into(),
            binds: binds.to_vec(),
            message: message.into(),
        }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Hosts => write!(f, "hosts"),
            Self::Connection => write!(f, "connection"),
            Self::Transaction => write!(f, "transaction"),
            Self::Constraint => write!(f, "constraint"),
            Self::Query => write!(f, "query"),
            Self::Pool => write!(f, "pool"),
            Self::Other => write!(f, "other"),
        }
    }
}
