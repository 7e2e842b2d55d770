//! # duraconn
//!
//! Durable relational connection toolkit: named-server configuration,
//! host failover, liveness-checked reuse, transaction lifecycle,
//! blocking connection pools and two-tier result caching.
//!
//! ## Features
//!
//! - **Durable connects**: host groups with randomized or
//!   primary/secondary selection, walked until a reachable host accepts
//! - **Transparent liveness**: idle transports are pinged before reuse
//!   and rebuilt through the same failover walk when dead
//! - **Transaction lifecycle**: sessions run with autocommit off;
//!   explicit commit/rollback, with unit-test mode swallowing commits
//! - **Connection pooling**: fixed-size blocking pools that align their
//!   recycling policy with the server's advertised idle timeout
//! - **Result caching**: per-statement cache directives over a
//!   process-local tier and a pluggable shared backend
//! - **Typed failures**: duplicate-key, foreign-key and collation
//!   violations surface as dedicated error variants
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use duraconn::prelude::*;
//! use std::sync::Arc;
//!
//! let config = DataStoreConfig::from_path("/etc/myapp/data_store.toml")?;
//! let mut ctx = Context::new(config, ExecMode::Service)
//!     .with_driver(Arc::new(duraconn::mysql::MySqlDriver::new()));
//!
//! // Acquire a handle for a server and run statements on it
//! let conn = ctx.acquire("primary", "orders", "main", true)?;
//! let rows = conn.query("select * from orders where id = ?", &[Value::Int(1)])?;
//! conn.commit(false)?;
//!
//! // Or checkout/return through a pool
//! ctx.start_pool("orders", "primary", "orders", "main", 8, true)?;
//! let pool = ctx.pool("default").unwrap();
//! pool.with_dsh(|conn| conn.count("select count(*) from orders", &[]))?;
//! ```
//!
//! ## Feature Flags
//!
//! - `mysql` - MySQL/MariaDB backend via the `mysql` crate
//! - `postgres` - PostgreSQL backend via the `postgres` crate
//! - `full` - all backends enabled

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod cache;
pub mod config;
pub mod connection;
pub mod context;
pub mod driver;
pub mod durability;
pub mod error;
pub mod pool;
pub mod provider;
pub mod stats;
pub mod testing;
pub mod types;

// Backend implementations (conditionally compiled)
#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Value and row model
    pub use crate::types::{QueryOutcome, Row, Value};

    // Configuration
    pub use crate::config::{
        BackendKind, DataStoreConfig, DurabilityKind, GroupConfig, HostEntry, ServerConfig,
    };

    // Connection lifecycle
    pub use crate::connection::{Connection, DEFAULT_PING_INTERVAL};

    // Pooling
    pub use crate::pool::{ConnectionPool, PoolConfig, LOW_IDLE_TIMEOUT};

    // Handle management
    pub use crate::context::{Context, ExecMode};
    pub use crate::provider::{autonomous_tx_stop_commit, autonomous_tx_stop_rollback};

    // Driver seam
    pub use crate::driver::{
        ConnectTarget, Driver, DriverConnection, DriverError, DriverErrorKind, DriverResult,
        ExecOutcome,
    };

    // Caching
    pub use crate::cache::{CacheBackend, CacheDirective, ResultCache};

    // Host selection
    pub use crate::durability::{selector_for, FallBack, HostSelector, Randomizer};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::Value;
