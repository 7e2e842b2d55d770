//! Tests for duraconn host failover

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use duraconn::prelude::*;
use duraconn::testing::MockDriver;

fn config_with(durability: DurabilityKind, hosts: &[&str]) -> DataStoreConfig {
    let mut group = GroupConfig::new(durability);
    for host in hosts {
        group = group.with_host(*host, "app", "secret");
    }
    DataStoreConfig::new().with_server(
        "primary",
        ServerConfig::new(BackendKind::MySql).with_group("main", group),
    )
}

fn connection(driver: &MockDriver, config: &DataStoreConfig) -> Connection {
    let settings = config.server("primary").unwrap();
    let mut conn = Connection::new(Arc::new(driver.clone()), None, ExecMode::Service);
    conn.configure(settings, "app", "main").unwrap();
    conn
}

// ==================== Randomizer Tests ====================

#[test]
fn test_randomizer_walks_to_a_reachable_host() {
    let driver = MockDriver::new();
    driver.set_unreachable("db1");
    driver.set_unreachable("db2");

    let config = config_with(DurabilityKind::Randomizer, &["db1", "db2", "db3"]);
    let mut conn = connection(&driver, &config);

    conn.connect().unwrap();
    assert!(conn.is_connected());
    assert_eq!(driver.connects(), 1);

    // Whatever order the walk took, it ended on the only live host.
    let attempted = driver.attempted_hosts();
    assert_eq!(attempted.last().map(String::as_str), Some("db3"));
    assert_eq!(driver.last_target().unwrap().host, "db3");
}

#[test]
fn test_randomizer_exhausts_every_host_before_failing() {
    let driver = MockDriver::new();
    driver.set_unreachable("db1");
    driver.set_unreachable("db2");
    driver.set_unreachable("db3");

    let config = config_with(DurabilityKind::Randomizer, &["db1", "db2", "db3"]);
    let mut conn = connection(&driver, &config);

    let err = conn.connect().unwrap_err();
    assert!(matches!(err, Error::NoHostsRemain));
    assert_eq!(err.to_string(), "no more hosts remain");
    assert!(!conn.is_connected());

    let mut attempted = driver.attempted_hosts();
    attempted.sort();
    assert_eq!(attempted, vec!["db1", "db2", "db3"]);
}

#[test]
fn test_recovered_host_serves_again() {
    let driver = MockDriver::new();
    driver.set_unreachable("db1");
    driver.set_unreachable("db2");

    let config = config_with(DurabilityKind::Randomizer, &["db1", "db2"]);
    let mut conn = connection(&driver, &config);
    assert!(matches!(conn.connect(), Err(Error::NoHostsRemain)));

    driver.set_reachable("db2");
    conn.connect().unwrap();
    assert_eq!(driver.last_target().unwrap().host, "db2");
}

// ==================== Fall Back Tests ====================

#[test]
fn test_fall_back_prefers_the_primary() {
    let driver = MockDriver::new();
    let config = config_with(DurabilityKind::FallBack, &["db1", "db2"]);
    let mut conn = connection(&driver, &config);

    conn.connect().unwrap();
    assert_eq!(driver.attempted_hosts(), vec!["db1"]);
    assert_eq!(driver.last_target().unwrap().host, "db1");
}

#[test]
fn test_fall_back_moves_to_the_secondary() {
    let driver = MockDriver::new();
    driver.set_unreachable("db1");

    let config = config_with(DurabilityKind::FallBack, &["db1", "db2"]);
    let mut conn = connection(&driver, &config);

    conn.connect().unwrap();
    assert_eq!(driver.attempted_hosts(), vec!["db1", "db2"]);
    assert_eq!(driver.last_target().unwrap().host, "db2");
}

#[test]
fn test_fall_back_rejects_wrong_host_counts() {
    let driver = MockDriver::new();

    for hosts in [vec!["db1"], vec!["db1", "db2", "db3"]] {
        let config = config_with(DurabilityKind::FallBack, &hosts);
        let mut conn = connection(&driver, &config);
        let err = conn.connect().unwrap_err();
        assert!(err.to_string().contains("exactly 2 hosts must be configured"));
    }
}

// ==================== Reconnect Tests ====================

#[test]
fn test_reconnect_walks_the_hosts_again() {
    let driver = MockDriver::new();
    let config = config_with(DurabilityKind::FallBack, &["db1", "db2"]);
    let mut conn = connection(&driver, &config);
    conn.set_ping_interval(Duration::ZERO);

    conn.query("select 1 from dual", &[]).unwrap();
    assert_eq!(driver.connects(), 1);
    assert_eq!(driver.last_target().unwrap().host, "db1");

    // The primary goes down while we hold a handle to it; the next use
    // notices on the liveness probe and lands on the secondary.
    driver.set_ping_fail(true);
    driver.set_unreachable("db1");
    conn.query("select 1 from dual", &[]).unwrap();

    assert_eq!(driver.connects(), 2);
    assert_eq!(driver.last_target().unwrap().host, "db2");
}

#[test]
fn test_reconnect_failure_surfaces_host_exhaustion() {
    let driver = MockDriver::new();
    let config = config_with(DurabilityKind::Randomizer, &["db1"]);
    let mut conn = connection(&driver, &config);
    conn.set_ping_interval(Duration::ZERO);

    conn.query("select 1 from dual", &[]).unwrap();

    driver.set_ping_fail(true);
    driver.set_unreachable("db1");
    let err = conn.query("select 1 from dual", &[]).unwrap_err();
    assert!(matches!(err, Error::NoHostsRemain));
}

// ==================== Non-Transport Failure Tests ====================

struct RefusingDriver {
    attempts: Arc<AtomicUsize>,
}

impl Driver for RefusingDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::MySql
    }

    fn connect(&self, _target: &ConnectTarget) -> DriverResult<Box<dyn DriverConnection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DriverError::other("access denied for user 'app'"))
    }
}

#[test]
fn test_non_transport_errors_stop_the_walk() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let driver = RefusingDriver {
        attempts: Arc::clone(&attempts),
    };

    let config = config_with(DurabilityKind::Randomizer, &["db1", "db2", "db3"]);
    let settings = config.server("primary").unwrap();
    let mut conn = Connection::new(Arc::new(driver), None, ExecMode::Service);
    conn.configure(settings, "app", "main").unwrap();

    // A rejected login is not a dead host; no other candidate is tried.
    let err = conn.connect().unwrap_err();
    assert!(matches!(err, Error::Connection { .. }));
    assert!(err.to_string().contains("access denied"));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_credentials_flow_to_the_selected_host() {
    let driver = MockDriver::new();
    let config = DataStoreConfig::new().with_server(
        "primary",
        ServerConfig::new(BackendKind::MySql).with_group(
            "main",
            GroupConfig::new(DurabilityKind::FallBack)
                .with_host("db1", "writer", "hunter2")
                .with_host("db2", "writer_standby", "hunter3"),
        ),
    );
    let settings = config.server("primary").unwrap();
    let mut conn = Connection::new(Arc::new(driver.clone()), None, ExecMode::Service);
    conn.configure(settings, "orders", "main").unwrap();

    conn.connect().unwrap();
    let target = driver.last_target().unwrap();
    assert_eq!(target.host, "db1");
    assert_eq!(target.username, "writer");
    assert_eq!(target.password, "hunter2");
    assert_eq!(target.db, "orders");
}
