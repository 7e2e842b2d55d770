//! Configuration for duraconn
//!
//! The configuration tree maps server names to backend type and
//! connection groups; each group names its durability algorithm and the
//! candidate hosts (with credentials) that algorithm selects from.
//!
//! Configs load from TOML or are assembled programmatically:
//!
//! ```
//! use duraconn::config::{BackendKind, DataStoreConfig, DurabilityKind, GroupConfig, ServerConfig};
//!
//! let config = DataStoreConfig::new().with_server(
//!     "primary",
//!     ServerConfig::new(BackendKind::MySql).with_group(
//!         "main",
//!         GroupConfig::new(DurabilityKind::Randomizer)
//!             .with_host("db1.internal", "app", "secret")
//!             .with_host("db2.internal", "app", "secret"),
//!     ),
//! );
//! assert!(config.server("primary").is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

/// Supported database backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// MySQL / MariaDB
    MySql,
    /// PostgreSQL
    #[serde(alias = "postgres")]
    PostgreSql,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MySql => write!(f, "mysql"),
            Self::PostgreSql => write!(f, "postgresql"),
        }
    }
}

/// Host-selection algorithm for a connection group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityKind {
    /// Pick uniformly at random among the remaining candidates
    #[serde(rename = "randomizer")]
    Randomizer,
    /// Exactly two hosts: primary first, then the secondary
    #[serde(rename = "fall back", alias = "fall_back", alias = "fallback")]
    FallBack,
}

impl fmt::Display for DurabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Randomizer => write!(f, "randomizer"),
            Self::FallBack => write!(f, "fall back"),
        }
    }
}

/// One candidate host with its credentials
///
/// Serializes as the three-element array form `["host", "user", "pass"]`
/// used by the configuration format.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String, String)", into = "(String, String, String)")]
pub struct HostEntry {
    /// Host name or address, optionally with a `:port` suffix
    pub host: String,
    /// Login user
    pub username: String,
    /// Login password
    pub password: String,
}

impl HostEntry {
    /// Create a new host entry
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl From<(String, String, String)> for HostEntry {
    fn from((host, username, password): (String, String, String)) -> Self {
        Self {
            host,
            username,
            password,
        }
    }
}

impl From<HostEntry> for (String, String, String) {
    fn from(entry: HostEntry) -> Self {
        (entry.host, entry.username, entry.password)
    }
}

impl fmt::Debug for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEntry")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One connection group: a durability algorithm over candidate hosts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Host-selection algorithm
    pub durability: DurabilityKind,
    /// Candidate hosts in configuration order
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

impl GroupConfig {
    /// Create a group with the given durability algorithm and no hosts
    pub fn new(durability: DurabilityKind) -> Self {
        Self {
            durability,
            hosts: Vec::new(),
        }
    }

    /// Append a candidate host
    pub fn with_host(
        mut self,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.hosts.push(HostEntry::new(host, username, password));
        self
    }
}

/// One configured database server: backend type plus its groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Backend type
    #[serde(rename = "type")]
    pub kind: BackendKind,
    /// Connection groups by name
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,
}

impl ServerConfig {
    /// Create a server config for the given backend
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            groups: HashMap::new(),
        }
    }

    /// Add a connection group
    pub fn with_group(mut self, name: impl Into<String>, group: GroupConfig) -> Self {
        self.groups.insert(name.into(), group);
        self
    }

    /// Look up a connection group by name
    pub fn group(&self, name: &str) -> Result<&GroupConfig> {
        self.groups.get(name).ok_or_else(|| {
            Error::configuration(format!("connection group \"{name}\" is not configured"))
        })
    }
}

/// The data store configuration: servers by name
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataStoreConfig {
    /// Configured servers by name
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

impl DataStoreConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server
    pub fn with_server(mut self, name: impl Into<String>, server: ServerConfig) -> Self {
        self.servers.insert(name.into(), server);
        self
    }

    /// Look up a server by name
    pub fn server(&self, name: &str) -> Result<&ServerConfig> {
        self.servers.get(name).ok_or_else(|| {
            Error::configuration(format!("data store server \"{name}\" is not configured"))
        })
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| Error::configuration(format!("invalid data store config: {e}")))
    }

    /// Load a configuration from a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!(
                "cannot read data store config {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[servers.primary]
type = "mysql"

[servers.primary.groups.main]
durability = "randomizer"
hosts = [
    ["db1.internal", "app", "secret"],
    ["db2.internal", "app", "secret"],
]

[servers.reporting]
type = "postgresql"

[servers.reporting.groups.main]
durability = "fall back"
hosts = [
    ["rpt1.internal:6432", "report", "hunter2"],
    ["rpt2.internal:6432", "report", "hunter2"],
]
"#;

    #[test]
    fn test_parse_toml() {
        let config = DataStoreConfig::from_toml_str(SAMPLE).unwrap();

        let primary = config.server("primary").unwrap();
        assert_eq!(primary.kind, BackendKind::MySql);
        let main = primary.group("main").unwrap();
        assert_eq!(main.durability, DurabilityKind::Randomizer);
        assert_eq!(main.hosts.len(), 2);
        assert_eq!(main.hosts[0].host, "db1.internal");
        assert_eq!(main.hosts[0].username, "app");

        let reporting = config.server("reporting").unwrap();
        assert_eq!(reporting.kind, BackendKind::PostgreSql);
        assert_eq!(
            reporting.group("main").unwrap().durability,
            DurabilityKind::FallBack
        );
    }

    #[test]
    fn test_lookup_errors() {
        let config = DataStoreConfig::from_toml_str(SAMPLE).unwrap();

        let err = config.server("missing").unwrap_err();
        assert!(err.to_string().contains("\"missing\" is not configured"));

        let err = config
            .server("primary")
            .unwrap()
            .group("nope")
            .unwrap_err();
        assert!(err.to_string().contains("\"nope\" is not configured"));
    }

    #[test]
    fn test_invalid_durability_rejected_at_parse() {
        let raw = r#"
[servers.a]
type = "mysql"

[servers.a.groups.g]
durability = "round robin"
hosts = [["h", "u", "p"]]
"#;
        assert!(DataStoreConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_durability_aliases() {
        let raw = r#"
[servers.a]
type = "postgres"

[servers.a.groups.g]
durability = "fall_back"
hosts = [["h1", "u", "p"], ["h2", "u", "p"]]
"#;
        let config = DataStoreConfig::from_toml_str(raw).unwrap();
        let server = config.server("a").unwrap();
        assert_eq!(server.kind, BackendKind::PostgreSql);
        assert_eq!(
            server.group("g").unwrap().durability,
            DurabilityKind::FallBack
        );
    }

    #[test]
    fn test_builders() {
        let config = DataStoreConfig::new().with_server(
            "primary",
            ServerConfig::new(BackendKind::MySql).with_group(
                "main",
                GroupConfig::new(DurabilityKind::FallBack)
                    .with_host("a", "u", "p")
                    .with_host("b", "u", "p"),
            ),
        );

        let group = config.server("primary").unwrap().group("main").unwrap();
        assert_eq!(group.hosts.len(), 2);
        assert_eq!(group.hosts[1].host, "b");
    }

    #[test]
    fn test_host_entry_debug_redacts_password() {
        let entry = HostEntry::new("db1", "app", "topsecret");
        let rendered = format!("{entry:?}");
        assert!(rendered.contains("db1"));
        assert!(!rendered.contains("topsecret"));
        assert!(rendered.contains("***"));
    }

}
