//! Tests for duraconn connection pooling

use std::sync::Arc;
use std::time::Duration;

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

fn start_pool(driver: &MockDriver, size: usize, mode: ExecMode) -> ConnectionPool {
    let config = sample_config();
    ConnectionPool::start(
        PoolConfig::new("workers", "app", "main").with_size(size),
        config.server("primary").unwrap(),
        Arc::new(driver.clone()),
        None,
        mode,
    )
    .unwrap()
}

fn raw_connection(driver: &MockDriver) -> Connection {
    let config = sample_config();
    let mut conn = Connection::new(Arc::new(driver.clone()), None, ExecMode::Service);
    conn.configure(config.server("primary").unwrap(), "app", "main")
        .unwrap();
    conn
}

// ==================== Startup Tests ====================

#[test]
fn test_start_validates_the_pool_name() {
    let driver = MockDriver::new();
    let config = sample_config();

    for name in ["Replicas", "pool-1", "pool 1", ""] {
        let err = ConnectionPool::start(
            PoolConfig::new(name, "app", "main"),
            config.server("primary").unwrap(),
            Arc::new(driver.clone()),
            None,
            ExecMode::Service,
        )
        .unwrap_err();
        assert!(err.to_string().contains("may only contain lowercase letters and underscores"));
    }
}

#[test]
fn test_start_validates_the_size() {
    let driver = MockDriver::new();
    let config = sample_config();

    let err = ConnectionPool::start(
        PoolConfig::new("workers", "app", "main").with_size(0),
        config.server("primary").unwrap(),
        Arc::new(driver),
        None,
        ExecMode::Service,
    )
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        "configuration error: size must be greater than or equal to 1"
    );
}

#[test]
fn test_start_probes_the_server_idle_timeout() {
    let driver = MockDriver::new();
    let pool = start_pool(&driver, 3, ExecMode::Service);

    assert_eq!(pool.idle_timeout(), Some(Duration::from_secs(28800)));
    assert_eq!(pool.size(), 3);
    assert_eq!(pool.available(), 3);

    // Exactly one slot was dialed, for the probe itself.
    assert_eq!(driver.connects(), 1);
    let executed = driver.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].0, MockDriver::PROBE);
}

#[test]
fn test_probed_timeout_follows_the_server_setting() {
    let driver = MockDriver::new();
    driver.stage_wait_timeout(600);

    let pool = start_pool(&driver, 1, ExecMode::Service);
    assert_eq!(pool.idle_timeout(), Some(Duration::from_secs(600)));
}

#[test]
fn test_start_fails_when_the_probe_returns_nothing() {
    let driver = MockDriver::new();
    driver.clear_rows(MockDriver::PROBE);

    let config = sample_config();
    let err = ConnectionPool::start(
        PoolConfig::new("workers", "app", "main"),
        config.server("primary").unwrap(),
        Arc::new(driver),
        None,
        ExecMode::Service,
    )
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        "configuration error: cannot determine server wait timeout"
    );
}

#[test]
fn test_probeless_driver_starts_cold() {
    let driver = MockDriver::new().without_probe();
    let pool = start_pool(&driver, 2, ExecMode::Service);

    assert_eq!(pool.idle_timeout(), None);
    assert_eq!(pool.available(), 2);
    assert_eq!(driver.connects(), 0);
    assert!(driver.executed().is_empty());
}

// ==================== Checkout and Release Tests ====================

#[test]
fn test_checkout_hands_out_live_connections() {
    let driver = MockDriver::new();
    let pool = start_pool(&driver, 2, ExecMode::Service);

    let conn = pool.get_dsh().unwrap();
    assert!(conn.is_connected());
    assert_eq!(pool.available(), 1);

    pool.release_dsh(conn).unwrap();
    assert_eq!(pool.available(), 2);
}

#[test]
fn test_every_slot_checks_out_without_blocking() {
    let driver = MockDriver::new();
    let pool = start_pool(&driver, 3, ExecMode::Service);

    let first = pool.get_dsh_timeout(Duration::from_millis(50)).unwrap();
    let second = pool.get_dsh_timeout(Duration::from_millis(50)).unwrap();
    let third = pool.get_dsh_timeout(Duration::from_millis(50)).unwrap();
    assert_eq!(pool.available(), 0);

    let err = pool.get_dsh_timeout(Duration::from_millis(50)).unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));

    pool.release_dsh(first).unwrap();
    pool.release_dsh(second).unwrap();
    pool.release_dsh(third).unwrap();
    assert_eq!(pool.available(), 3);
}

#[test]
fn test_bounded_checkout_times_out_when_exhausted() {
    let driver = MockDriver::new();
    let pool = start_pool(&driver, 1, ExecMode::Service);

    let held = pool.get_dsh().unwrap();
    let err = pool.get_dsh_timeout(Duration::from_millis(50)).unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));
    assert_eq!(
        err.to_string(),
        "pool exhausted: no connections available; consider resizing pool"
    );

    pool.release_dsh(held).unwrap();
    let conn = pool.get_dsh_timeout(Duration::from_millis(50)).unwrap();
    pool.release_dsh(conn).unwrap();
}

#[test]
fn test_release_wakes_a_blocked_checkout() {
    let driver = MockDriver::new();
    let pool = Arc::new(start_pool(&driver, 1, ExecMode::Service));

    let held = pool.get_dsh().unwrap();
    let waiter = {
        let pool = Arc::clone(&pool);
        std::thread::spawn(move || {
            let conn = pool.get_dsh()?;
            pool.release_dsh(conn)
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    pool.release_dsh(held).unwrap();

    waiter.join().unwrap().unwrap();
    assert_eq!(pool.available(), 1);
}

#[test]
fn test_foreign_connections_are_rejected() {
    let driver = MockDriver::new();
    let pool = start_pool(&driver, 1, ExecMode::Service);

    let err = pool.release_dsh(raw_connection(&driver)).unwrap_err();
    assert!(matches!(err, Error::NotPooled));
    assert_eq!(err.to_string(), "connection was not properly retrieved from pool");

    // A connection from one pool cannot be returned to another.
    let other = start_pool(&driver, 1, ExecMode::Service);
    let conn = other.get_dsh().unwrap();
    let err = pool.release_dsh(conn).unwrap_err();
    assert!(matches!(err, Error::NotPooled));
}

#[test]
fn test_with_dsh_releases_on_every_path() {
    let driver = MockDriver::new();
    let pool = start_pool(&driver, 1, ExecMode::Service);

    let connected = pool.with_dsh(|conn| Ok(conn.is_connected())).unwrap();
    assert!(connected);
    assert_eq!(pool.available(), 1);

    let err = pool
        .with_dsh(|_conn| Err::<(), Error>(Error::internal("boom")))
        .unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert_eq!(pool.available(), 1);
}

// ==================== Transaction Hygiene Tests ====================

#[test]
fn test_release_rolls_back_open_work() {
    let driver = MockDriver::new();
    let pool = start_pool(&driver, 1, ExecMode::Service);
    let after_start = driver.rollbacks();

    let mut conn = pool.get_dsh().unwrap();
    conn.query("insert into t(a) values (?)", &[Value::Int(1)]).unwrap();
    pool.release_dsh(conn).unwrap();

    assert_eq!(driver.rollbacks(), after_start + 1);
    assert_eq!(driver.commits(), 0);
}

#[test]
fn test_unit_test_release_skips_the_rollback() {
    let driver = MockDriver::new();
    let pool = start_pool(&driver, 1, ExecMode::UnitTest);

    let mut conn = pool.get_dsh().unwrap();
    conn.query("insert into t(a) values (?)", &[Value::Int(1)]).unwrap();
    pool.release_dsh(conn).unwrap();

    assert_eq!(driver.rollbacks(), 0);
}

#[test]
fn test_failed_rollback_drops_the_transport_but_frees_the_slot() {
    let driver = MockDriver::new();
    let pool = start_pool(&driver, 1, ExecMode::Service);
    driver.set_rollback_fail(true);

    let mut conn = pool.get_dsh().unwrap();
    conn.query("insert into t(a) values (1)", &[]).unwrap();
    assert_eq!(driver.connects(), 1);

    // The release still succeeds; the broken transaction just costs the
    // transport.
    pool.release_dsh(conn).unwrap();
    assert_eq!(pool.available(), 1);

    driver.set_rollback_fail(false);
    let conn = pool.get_dsh().unwrap();
    assert!(conn.is_connected());
    assert_eq!(driver.connects(), 2);
    pool.release_dsh(conn).unwrap();
}

// ==================== Slot Reuse Tests ====================

#[test]
fn test_warm_slot_counts_as_a_hit() {
    let driver = MockDriver::new();
    let pool = start_pool(&driver, 1, ExecMode::Service);

    let conn = pool.get_dsh().unwrap();
    pool.release_dsh(conn).unwrap();

    // Two checkouts so far: the cold probe and one warm reuse.
    let usage = pool.slot_usage();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].requests, 2);
    assert_eq!(usage[0].hits, 1);
    assert_eq!(driver.connects(), 1);
}

#[test]
fn test_slot_idle_past_the_server_deadline_is_redialed() {
    let driver = MockDriver::new();
    // A 1s server timeout is inside the probe margin, so every reuse
    // counts as stale without the test having to sleep.
    driver.stage_wait_timeout(1);
    let pool = start_pool(&driver, 1, ExecMode::Service);
    assert_eq!(driver.connects(), 1);

    let conn = pool.get_dsh().unwrap();
    assert_eq!(driver.connects(), 2);
    pool.release_dsh(conn).unwrap();

    let conn = pool.get_dsh().unwrap();
    assert_eq!(driver.connects(), 3);
    pool.release_dsh(conn).unwrap();

    let usage = pool.slot_usage();
    assert_eq!(usage[0].requests, 3);
    assert_eq!(usage[0].hits, 0);
}
