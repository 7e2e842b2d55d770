//! MySQL backend driver
//!
//! Speaks to MySQL and MariaDB servers over the `mysql` crate:
//! - Transports open with autocommit disabled so every statement joins
//!   the session's implicit transaction
//! - Vendor codes 1062, 1271 and 1452 are classified so the lifecycle
//!   layer can raise typed constraint errors
//! - Temporal columns are rendered in the server's canonical text form

use std::time::Duration;

use ::mysql::prelude::Queryable;
use ::mysql::{Conn, OptsBuilder, Params};

use crate::config::BackendKind;
use crate::driver::{
    ConnectTarget, Driver, DriverConnection, DriverError, DriverResult, ExecOutcome,
};
use crate::types::{Row, Value};

const DEFAULT_PORT: u16 = 3306;

/// Transport establishment deadline. A down host has to fail fast so
/// the durability walk can move to the next candidate.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Vendor error codes with dedicated classifications.
const ER_DUP_ENTRY: u16 = 1062;
const ER_CANT_AGGREGATE_COLLATIONS: u16 = 1271;
const ER_NO_REFERENCED_ROW: u16 = 1452;

/// Convert a bind value to a MySQL wire parameter
fn value_to_sql(value: &Value) -> ::mysql::Value {
    match value {
        Value::Null => ::mysql::Value::NULL,
        Value::Bool(b) => ::mysql::Value::Int(i64::from(*b)),
        Value::Int(n) => ::mysql::Value::Int(*n),
        Value::UInt(n) => ::mysql::Value::UInt(*n),
        Value::Float(n) => ::mysql::Value::Double(*n),
        Value::Text(s) => ::mysql::Value::Bytes(s.clone().into_bytes()),
        Value::Bytes(b) => ::mysql::Value::Bytes(b.clone()),
    }
}

/// Convert a MySQL result value to the crate value model
fn mysql_value_to_value(value: ::mysql::Value) -> Value {
    match value {
        ::mysql::Value::NULL => Value::Null,
        ::mysql::Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Value::Text(text),
            Err(err) => Value::Bytes(err.into_bytes()),
        },
        ::mysql::Value::Int(n) => Value::Int(n),
        ::mysql::Value::UInt(n) => Value::UInt(n),
        ::mysql::Value::Float(n) => Value::Float(f64::from(n)),
        ::mysql::Value::Double(n) => Value::Float(n),
        ::mysql::Value::Date(year, month, day, hour, min, sec, micro) => {
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                Value::Text(format!("{year:04}-{month:02}-{day:02}"))
            } else if micro == 0 {
                Value::Text(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{min:02}:{sec:02}"
                ))
            } else {
                Value::Text(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{min:02}:{sec:02}.{micro:06}"
                ))
            }
        }
        ::mysql::Value::Time(negative, days, hours, minutes, seconds, micro) => {
            let sign = if negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(hours);
            if micro == 0 {
                Value::Text(format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}"))
            } else {
                Value::Text(format!(
                    "{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micro:06}"
                ))
            }
        }
    }
}

/// Convert a MySQL result row into the crate row shape
fn mysql_row_to_row(row: ::mysql::Row) -> Row {
    let columns: Vec<String> = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().to_string())
        .collect();

    let values: Vec<Value> = (0..row.len())
        .map(|i| mysql_value_to_value(row.get(i).unwrap_or(::mysql::Value::NULL)))
        .collect();

    Row::new(columns, values)
}

/// Sort a connect failure into "try the next host" and everything else.
/// Only transport-level failures advance the walk; errors the server
/// itself reports (bad credentials, unknown database) propagate.
fn classify_connect(err: ::mysql::Error) -> DriverError {
    match err {
        ::mysql::Error::IoError(io) => DriverError::host_unreachable(io.to_string()),
        other => DriverError::other(other.to_string()),
    }
}

/// Map a server-reported statement failure onto the driver taxonomy
fn classify_server_error(code: u16, message: String) -> DriverError {
    match code {
        ER_DUP_ENTRY => DriverError::duplicate_key(message),
        ER_CANT_AGGREGATE_COLLATIONS => DriverError::collation_mix(message),
        ER_NO_REFERENCED_ROW => DriverError::foreign_key(message),
        _ => DriverError::execution(message),
    }
}

fn classify_exec(err: ::mysql::Error) -> DriverError {
    match err {
        ::mysql::Error::MySqlError(server) => classify_server_error(server.code, server.message),
        other => DriverError::other(other.to_string()),
    }
}

/// MySQL backend driver
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDriver;

impl MySqlDriver {
    /// Create a new MySQL driver
    pub fn new() -> Self {
        Self
    }
}

impl Driver for MySqlDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::MySql
    }

    fn connect(&self, target: &ConnectTarget) -> DriverResult<Box<dyn DriverConnection>> {
        let (host, port) = split_host_port(&target.host);

        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(host))
            .tcp_port(port)
            .user(Some(target.username.as_str()))
            .pass(Some(target.password.as_str()))
            .db_name(Some(target.db.as_str()))
            .tcp_connect_timeout(Some(CONNECT_TIMEOUT))
            .init(vec![
                format!("set names {}", target.charset),
                "set autocommit = 0".to_string(),
            ]);

        let conn = Conn::new(opts).map_err(classify_connect)?;
        Ok(Box::new(MySqlConnection { conn }))
    }

    fn idle_timeout_probe(&self) -> Option<&'static str> {
        Some("show variables like 'wait_timeout'")
    }
}

/// One open MySQL transport
struct MySqlConnection {
    conn: Conn,
}

impl DriverConnection for MySqlConnection {
    fn execute(
        &mut self,
        sql: &str,
        binds: &[Value],
        _expect_rows: bool,
    ) -> DriverResult<ExecOutcome> {
        let params = if binds.is_empty() {
            Params::Empty
        } else {
            Params::Positional(binds.iter().map(value_to_sql).collect())
        };

        let result: Vec<::mysql::Row> = self.conn.exec(sql, params).map_err(classify_exec)?;
        let rows = result.into_iter().map(mysql_row_to_row).collect();

        let affected = self.conn.affected_rows();
        let last_insert_id = match self.conn.last_insert_id() {
            0 => None,
            id => Some(id),
        };

        Ok(ExecOutcome {
            rows,
            affected,
            last_insert_id,
        })
    }

    fn ping(&mut self) -> DriverResult<()> {
        if self.conn.ping() {
            Ok(())
        } else {
            Err(DriverError::other("server did not answer the ping"))
        }
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.conn.query_drop("commit").map_err(classify_exec)
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.conn.query_drop("rollback").map_err(classify_exec)
    }

    fn close(&mut self) -> DriverResult<()> {
        // The transport sends its quit command when dropped.
        Ok(())
    }

    fn connection_id(&self) -> u64 {
        u64::from(self.conn.connection_id())
    }
}

fn split_host_port(host: &str) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => match port.parse() {
            Ok(port) => (name.to_string(), port),
            Err(_) => (host.to_string(), DEFAULT_PORT),
        },
        _ => (host.to_string(), DEFAULT_PORT),
    }
}
