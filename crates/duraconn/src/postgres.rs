//! PostgreSQL backend driver
//!
//! Speaks to PostgreSQL servers over the `postgres` crate:
//! - Statements run inside an explicitly opened transaction, so commit
//!   and rollback behave the same as on backends with autocommit off
//! - Binds are coerced onto the parameter types the server infers
//!   during prepare
//! - SQLSTATE classes 23505 and 23503 are classified so the lifecycle
//!   layer can raise typed constraint errors

use std::time::Duration;

use ::postgres::error::SqlState;
use ::postgres::types::{ToSql, Type};
use ::postgres::{Client, Config, NoTls};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;

use crate::config::BackendKind;
use crate::driver::{
    ConnectTarget, Driver, DriverConnection, DriverError, DriverResult, ExecOutcome,
};
use crate::types::{Row, Value};

const DEFAULT_PORT: u16 = 5432;

/// Transport establishment deadline. A down host has to fail fast so
/// the durability walk can move to the next candidate.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// PostgreSQL backend driver
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    /// Create a new PostgreSQL driver
    pub fn new() -> Self {
        Self
    }
}

impl Driver for PostgresDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::PostgreSql
    }

    fn connect(&self, target: &ConnectTarget) -> DriverResult<Box<dyn DriverConnection>> {
        let (host, port) = split_host_port(&target.host);

        let mut config = Config::new();
        config
            .host(&host)
            .port(port)
            .user(&target.username)
            .password(&target.password)
            .dbname(&target.db)
            .options(&format!("-c client_encoding={}", target.charset))
            .connect_timeout(CONNECT_TIMEOUT);

        // This backend reports authentication failures the same way as
        // refused transports, so every establishment failure advances
        // the host walk.
        let mut client = config
            .connect(NoTls)
            .map_err(|err| DriverError::host_unreachable(err.to_string()))?;

        let backend_pid = fetch_backend_pid(&mut client)?;

        Ok(Box::new(PostgresConnection {
            client,
            backend_pid,
            in_tx: false,
        }))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }
}

fn fetch_backend_pid(client: &mut Client) -> DriverResult<u64> {
    let row = client
        .query_one("select pg_backend_pid()", &[])
        .map_err(|err| DriverError::other(err.to_string()))?;
    let pid: i32 = row
        .try_get(0)
        .map_err(|err| DriverError::other(err.to_string()))?;
    Ok(u64::from(pid.unsigned_abs()))
}

/// One open PostgreSQL transport
struct PostgresConnection {
    client: Client,
    backend_pid: u64,
    in_tx: bool,
}

impl PostgresConnection {
    /// Open the explicit transaction when no statement has run since
    /// the last commit or rollback.
    fn ensure_tx(&mut self) -> DriverResult<()> {
        if !self.in_tx {
            self.client.batch_execute("begin").map_err(classify_exec)?;
            self.in_tx = true;
        }
        Ok(())
    }
}

impl DriverConnection for PostgresConnection {
    fn execute(
        &mut self,
        sql: &str,
        binds: &[Value],
        expect_rows: bool,
    ) -> DriverResult<ExecOutcome> {
        self.ensure_tx()?;

        let stmt = self.client.prepare(sql).map_err(classify_exec)?;
        if stmt.params().len() != binds.len() {
            return Err(DriverError::execution(format!(
                "statement declares {} parameters but {} were bound",
                stmt.params().len(),
                binds.len()
            )));
        }

        let params: Vec<Box<dyn ToSql + Sync>> = binds
            .iter()
            .zip(stmt.params())
            .map(|(value, ty)| bind_param(value, ty))
            .collect::<DriverResult<_>>()?;
        let param_refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        if expect_rows {
            let pg_rows = self
                .client
                .query(&stmt, &param_refs)
                .map_err(classify_exec)?;
            Ok(ExecOutcome {
                rows: pg_rows.iter().map(pg_row_to_row).collect(),
                affected: 0,
                last_insert_id: None,
            })
        } else {
            let affected = self
                .client
                .execute(&stmt, &param_refs)
                .map_err(classify_exec)?;
            Ok(ExecOutcome {
                rows: Vec::new(),
                affected,
                // Generated keys come back through `returning` clauses,
                // not through a session-level counter.
                last_insert_id: None,
            })
        }
    }

    fn ping(&mut self) -> DriverResult<()> {
        self.client
            .simple_query("select 1")
            .map(|_| ())
            .map_err(|err| DriverError::other(err.to_string()))
    }

    fn commit(&mut self) -> DriverResult<()> {
        if !self.in_tx {
            return Ok(());
        }
        self.in_tx = false;
        self.client.batch_execute("commit").map_err(classify_exec)
    }

    fn rollback(&mut self) -> DriverResult<()> {
        if !self.in_tx {
            return Ok(());
        }
        self.in_tx = false;
        self.client.batch_execute("rollback").map_err(classify_exec)
    }

    fn close(&mut self) -> DriverResult<()> {
        // The transport terminates cleanly when dropped.
        Ok(())
    }

    fn connection_id(&self) -> u64 {
        self.backend_pid
    }
}

/// Coerce one bind onto the wire type the server inferred for its
/// placeholder during prepare.
fn bind_param(value: &Value, ty: &Type) -> DriverResult<Box<dyn ToSql + Sync>> {
    let mismatch = || DriverError::execution(format!("cannot bind {value:?} as {ty}"));

    let param: Box<dyn ToSql + Sync> = match *ty {
        Type::BOOL => match value {
            Value::Null => Box::new(Option::<bool>::None),
            other => Box::new(other.as_bool().ok_or_else(mismatch)?),
        },
        Type::INT2 => match value {
            Value::Null => Box::new(Option::<i16>::None),
            other => {
                let n = other.as_i64().ok_or_else(mismatch)?;
                Box::new(i16::try_from(n).map_err(|_| mismatch())?)
            }
        },
        Type::INT4 => match value {
            Value::Null => Box::new(Option::<i32>::None),
            other => {
                let n = other.as_i64().ok_or_else(mismatch)?;
                Box::new(i32::try_from(n).map_err(|_| mismatch())?)
            }
        },
        Type::INT8 => match value {
            Value::Null => Box::new(Option::<i64>::None),
            other => Box::new(other.as_i64().ok_or_else(mismatch)?),
        },
        Type::FLOAT4 => match value {
            Value::Null => Box::new(Option::<f32>::None),
            other => Box::new(other.as_f64().ok_or_else(mismatch)? as f32),
        },
        Type::FLOAT8 => match value {
            Value::Null => Box::new(Option::<f64>::None),
            other => Box::new(other.as_f64().ok_or_else(mismatch)?),
        },
        Type::NUMERIC => match value {
            Value::Null => Box::new(Option::<Decimal>::None),
            other => Box::new(decimal_from_value(other).ok_or_else(mismatch)?),
        },
        Type::BYTEA => match value {
            Value::Null => Box::new(Option::<Vec<u8>>::None),
            Value::Bytes(b) => Box::new(b.clone()),
            Value::Text(s) => Box::new(s.clone().into_bytes()),
            _ => return Err(mismatch()),
        },
        Type::DATE => match value {
            Value::Null => Box::new(Option::<NaiveDate>::None),
            other => {
                let s = other.as_str().ok_or_else(mismatch)?;
                Box::new(NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| mismatch())?)
            }
        },
        Type::TIME => match value {
            Value::Null => Box::new(Option::<NaiveTime>::None),
            other => {
                let s = other.as_str().ok_or_else(mismatch)?;
                Box::new(NaiveTime::parse_from_str(s, "%H:%M:%S%.f").map_err(|_| mismatch())?)
            }
        },
        Type::TIMESTAMP => match value {
            Value::Null => Box::new(Option::<NaiveDateTime>::None),
            other => {
                let s = other.as_str().ok_or_else(mismatch)?;
                Box::new(
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                        .map_err(|_| mismatch())?,
                )
            }
        },
        Type::TIMESTAMPTZ => match value {
            Value::Null => Box::new(Option::<DateTime<Utc>>::None),
            other => {
                let s = other.as_str().ok_or_else(mismatch)?;
                let utc = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
                    .map(|dt| dt.with_timezone(&Utc))
                    .or_else(|_| {
                        // A rendering without an offset is taken as UTC.
                        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                            .map(|naive| naive.and_utc())
                    })
                    .map_err(|_| mismatch())?;
                Box::new(utc)
            }
        },
        Type::JSON | Type::JSONB => match value {
            Value::Null => Box::new(Option::<serde_json::Value>::None),
            Value::Text(s) => {
                let json: serde_json::Value = serde_json::from_str(s).map_err(|_| mismatch())?;
                Box::new(json)
            }
            _ => return Err(mismatch()),
        },
        _ => match value {
            Value::Null => Box::new(Option::<String>::None),
            Value::Text(s) => Box::new(s.clone()),
            Value::Bool(b) => Box::new(b.to_string()),
            Value::Int(n) => Box::new(n.to_string()),
            Value::UInt(n) => Box::new(n.to_string()),
            Value::Float(n) => Box::new(n.to_string()),
            Value::Bytes(_) => return Err(mismatch()),
        },
    };

    Ok(param)
}

fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Int(n) => Some(Decimal::from(*n)),
        Value::UInt(n) => Some(Decimal::from(*n)),
        Value::Float(n) => Decimal::from_f64_retain(*n),
        Value::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Convert a result row into the crate row shape
fn pg_row_to_row(row: &::postgres::Row) -> Row {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();

    let values: Vec<Value> = row
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| pg_value_to_value(row, idx, column.type_()))
        .collect();

    Row::new(columns, values)
}

/// Decode one result column into the crate value model. Values that
/// fail to decode come back as NULL rather than failing the whole row.
fn pg_value_to_value(row: &::postgres::Row, idx: usize, ty: &Type) -> Value {
    match *ty {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|n| Value::Int(i64::from(n)))
            .unwrap_or(Value::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|n| Value::Int(i64::from(n)))
            .unwrap_or(Value::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)
            .ok()
            .flatten()
            .map(|n| Value::UInt(u64::from(n)))
            .unwrap_or(Value::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|n| Value::Float(f64::from(n)))
            .unwrap_or(Value::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(idx)
            .ok()
            .flatten()
            .map(|d| Value::Text(d.to_string()))
            .unwrap_or(Value::Null),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(|t| Value::Text(t.format("%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string()))
            .unwrap_or(Value::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(|j| Value::Text(j.to_string()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null),
    }
}

/// Translate a statement failure into the driver taxonomy
fn classify_exec(err: ::postgres::Error) -> DriverError {
    let Some(db) = err.as_db_error() else {
        return DriverError::other(err.to_string());
    };

    if *db.code() == SqlState::UNIQUE_VIOLATION {
        DriverError::duplicate_key(db.message())
    } else if *db.code() == SqlState::FOREIGN_KEY_VIOLATION {
        DriverError::foreign_key(db.message())
    } else {
        DriverError::execution(db.message())
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
