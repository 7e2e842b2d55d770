//! Tests for context-managed connection handles

use std::sync::Arc;

use duraconn::prelude::*;
use duraconn::testing::MockDriver;

fn sample_config() -> DataStoreConfig {
    DataStoreConfig::new().with_server(
        "primary",
        ServerConfig::new(BackendKind::MySql).with_group(
            "main",
            GroupConfig::new(DurabilityKind::Randomizer).with_host("db1", "app", "secret"),
        ),
    )
}

fn context(driver: &MockDriver, mode: ExecMode) -> Context {
    Context::new(sample_config(), mode).with_driver(Arc::new(driver.clone()))
}

// ==================== Handle Reuse Tests ====================

#[test]
fn test_acquire_caches_the_handle_per_server() {
    let driver = MockDriver::new();
    let mut ctx = context(&driver, ExecMode::Service);

    {
        let conn = ctx.acquire("primary", "app", "main", true).unwrap();
        conn.query("select 1 from dual", &[]).unwrap();
    }
    {
        let conn = ctx.acquire("primary", "app", "main", true).unwrap();
        conn.query("select 1 from dual", &[]).unwrap();
    }

    assert_eq!(driver.connects(), 1);
    let stats = ctx.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.hits, 1);
}

#[test]
fn test_release_then_acquire_redials() {
    let driver = MockDriver::new();
    let mut ctx = context(&driver, ExecMode::Service);

    {
        let conn = ctx.acquire("primary", "app", "main", true).unwrap();
        conn.query("select 1 from dual", &[]).unwrap();
    }
    ctx.release_dsh("primary").unwrap();

    {
        let conn = ctx.acquire("primary", "app", "main", true).unwrap();
        conn.query("select 1 from dual", &[]).unwrap();
    }

    assert_eq!(driver.connects(), 2);
    assert_eq!(ctx.stats().hits, 0);
}

#[test]
fn test_cli_mode_forces_short_lived_handles() {
    let driver = MockDriver::new();
    let mut ctx = context(&driver, ExecMode::Cli);

    let conn = ctx.acquire("primary", "app", "main", true).unwrap();
    assert!(!conn.is_persistent());
}

#[test]
fn test_unknown_group_surfaces_at_acquire() {
    let driver = MockDriver::new();
    let mut ctx = context(&driver, ExecMode::Service);

    let err = ctx.acquire("primary", "app", "nope", true).unwrap_err();
    assert!(err.to_string().contains("connection group \"nope\" is not configured"));
}

#[test]
fn test_driver_registry_is_keyed_by_backend() {
    let driver = MockDriver::new();
    let ctx = context(&driver, ExecMode::Service);

    assert!(ctx.driver_for(BackendKind::MySql).is_ok());
    let err = ctx.driver_for(BackendKind::PostgreSql).unwrap_err();
    assert!(err.to_string().contains("no driver registered for postgresql"));
}

// ==================== Pooled Context Tests ====================

#[test]
fn test_default_pool_feeds_acquisitions() {
    let driver = MockDriver::new();
    let mut ctx = context(&driver, ExecMode::Service);
    ctx.start_pool("workers", "primary", "app", "main", 2, true).unwrap();

    let pool = ctx.pool("default").unwrap();
    assert_eq!(pool.available(), 2);

    {
        let conn = ctx.acquire("primary", "app", "main", true).unwrap();
        conn.query("select 1 from dual", &[]).unwrap();
    }
    assert_eq!(pool.available(), 1);

    ctx.release_dsh("primary").unwrap();
    assert_eq!(pool.available(), 2);
}

#[test]
fn test_named_pool_is_not_used_by_acquire() {
    let driver = MockDriver::new();
    let mut ctx = context(&driver, ExecMode::Service);
    ctx.start_pool("analytics", "primary", "app", "main", 2, false).unwrap();

    assert!(ctx.pool("analytics").is_some());
    assert!(ctx.pool("default").is_none());

    let pool = ctx.pool("analytics").unwrap();
    {
        let conn = ctx.acquire("primary", "app", "main", true).unwrap();
        conn.query("select 1 from dual", &[]).unwrap();
    }
    // The acquisition went to a raw handle, not the named pool.
    assert_eq!(pool.available(), 2);
}

#[test]
fn test_starting_the_same_pool_twice_fails() {
    let driver = MockDriver::new();
    let mut ctx = context(&driver, ExecMode::Service);

    ctx.start_pool("workers", "primary", "app", "main", 1, true).unwrap();
    let err = ctx
        .start_pool("workers", "primary", "app", "main", 1, true)
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "configuration error: cannot start connection pool because it is already running"
    );
}

#[test]
fn test_context_teardown_returns_pooled_handles() {
    let driver = MockDriver::new();
    let mut ctx = context(&driver, ExecMode::Service);
    ctx.start_pool("workers", "primary", "app", "main", 1, true).unwrap();
    let pool = ctx.pool("default").unwrap();

    {
        let conn = ctx.acquire("primary", "app", "main", true).unwrap();
        conn.query("select 1 from dual", &[]).unwrap();
    }
    assert_eq!(pool.available(), 0);

    drop(ctx);
    assert_eq!(pool.available(), 1);
}

#[test]
fn test_fork_shares_the_pool_registry_but_not_handles() {
    let driver = MockDriver::new();
    let mut ctx = context(&driver, ExecMode::Service);
    ctx.start_pool("workers", "primary", "app", "main", 2, true).unwrap();
    let pool = ctx.pool("default").unwrap();

    {
        let conn = ctx.acquire("primary", "app", "main", true).unwrap();
        conn.query("select 1 from dual", &[]).unwrap();
    }
    assert_eq!(pool.available(), 1);

    let mut forked = ctx.fork();
    assert!(forked.pool("default").is_some());
    assert_eq!(forked.stats().requests, 0);

    {
        let conn = forked.acquire("primary", "app", "main", true).unwrap();
        conn.query("select 1 from dual", &[]).unwrap();
    }
    assert_eq!(pool.available(), 0);

    drop(forked);
    assert_eq!(pool.available(), 1);

    ctx.release_dsh("primary").unwrap();
    assert_eq!(pool.available(), 2);
}

// ==================== Autonomous Transaction Tests ====================

#[test]
fn test_autonomous_commit_path() {
    let driver = MockDriver::new();
    let ctx = context(&driver, ExecMode::Service);

    let mut conn = ctx.autonomous_tx_start("primary", "app", "main").unwrap();
    assert!(!conn.is_persistent());

    conn.query("insert into audit(note) values (?)", &[Value::Text("ok".into())])
        .unwrap();
    autonomous_tx_stop_commit(conn, false).unwrap();
    assert_eq!(driver.commits(), 1);
}

#[test]
fn test_autonomous_rollback_path() {
    let driver = MockDriver::new();
    let ctx = context(&driver, ExecMode::Service);

    let mut conn = ctx.autonomous_tx_start("primary", "app", "main").unwrap();
    conn.query("insert into audit(note) values (?)", &[Value::Text("ok".into())])
        .unwrap();
    autonomous_tx_stop_rollback(conn, false).unwrap();
    assert_eq!(driver.rollbacks(), 1);
    assert_eq!(driver.commits(), 0);
}

#[test]
fn test_autonomous_transaction_is_isolated_from_the_held_handle() {
    let driver = MockDriver::new();
    let mut ctx = context(&driver, ExecMode::Service);

    {
        let conn = ctx.acquire("primary", "app", "main", true).unwrap();
        conn.query("select 1 from dual", &[]).unwrap();
    }
    assert_eq!(driver.connects(), 1);

    let mut side = ctx.autonomous_tx_start("primary", "app", "main").unwrap();
    side.query("insert into audit(note) values (1)", &[]).unwrap();
    assert_eq!(driver.connects(), 2);
    autonomous_tx_stop_rollback(side, false).unwrap();

    // The held handle is untouched by the side transaction.
    {
        let conn = ctx.acquire("primary", "app", "main", true).unwrap();
        conn.query("select 1 from dual", &[]).unwrap();
    }
    assert_eq!(driver.connects(), 2);
}

#[test]
fn test_stop_commit_before_any_statement() {
    let driver = MockDriver::new();
    let ctx = context(&driver, ExecMode::Service);

    let conn = ctx.autonomous_tx_start("primary", "app", "main").unwrap();
    autonomous_tx_stop_commit(conn, true).unwrap();

    let conn = ctx.autonomous_tx_start("primary", "app", "main").unwrap();
    let err = autonomous_tx_stop_commit(conn, false).unwrap_err();
    assert!(matches!(err, Error::NotConnected { .. }));
}

#[test]
fn test_autonomous_commit_is_suppressed_under_unit_test_mode() {
    let driver = MockDriver::new();
    let ctx = context(&driver, ExecMode::UnitTest);

    let mut conn = ctx.autonomous_tx_start("primary", "app", "main").unwrap();
    conn.query("insert into audit(note) values (1)", &[]).unwrap();
    autonomous_tx_stop_commit(conn, false).unwrap();
    assert_eq!(driver.commits(), 0);
}
