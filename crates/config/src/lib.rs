//! Configuration schema and loader for orkv nodes.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Store location and read policy.
    #[serde(default)]
    pub server: ServerSection,

    /// Gossip membership settings.
    #[serde(default)]
    pub peering: PeeringSection,

    /// Op-log pipeline sizing.
    #[serde(default)]
    pub oplog: OpLogSection,

    /// REST API settings.
    #[serde(default)]
    pub api: ApiSection,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Collision policy applied on read: "none" or "lww".
    #[serde(default = "default_collision")]
    pub collision: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            collision: default_collision(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeeringSection {
    /// Base node name. A unique suffix is added at startup.
    #[serde(default = "default_name")]
    pub name: String,

    /// Interface to bind; all interfaces when unset.
    #[serde(default)]
    pub bind_addr: Option<IpAddr>,

    /// Gossip stream port. Packets use `bind_port + 1`.
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    #[serde(default)]
    pub advertise_address: Option<IpAddr>,

    #[serde(default)]
    pub advertise_port: u16,

    /// `host:port` peers to join at startup.
    #[serde(default)]
    pub join: Vec<String>,

    /// Node names whose metadata is ignored.
    #[serde(default)]
    pub block: Vec<String>,

    /// Gossip timings: "wan", "lan" or "local".
    #[serde(default = "default_profile")]
    pub profile: String,

    #[serde(default)]
    pub federation: FederationSection,
}

impl Default for PeeringSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            bind_addr: None,
            bind_port: default_bind_port(),
            advertise_address: None,
            advertise_port: 0,
            join: Vec::new(),
            block: Vec::new(),
            profile: default_profile(),
            federation: FederationSection::default(),
        }
    }
}

/// Metadata advertised to other members.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FederationSection {
    /// Defaults to `peering.name` when empty.
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub api_ingress: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpLogSection {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_commit_buffer")]
    pub commit_buffer: usize,

    /// 0 disables the replica channel.
    #[serde(default = "default_replica_buffer")]
    pub replica_buffer: usize,

    #[serde(default)]
    pub drain_on_stop: bool,
}

impl Default for OpLogSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            commit_buffer: default_commit_buffer(),
            replica_buffer: default_replica_buffer(),
            drain_on_stop: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_api_bind")]
    pub bind: SocketAddr,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
        }
    }
}

// --- Defaults ---

fn default_db_path() -> PathBuf {
    PathBuf::from("orkv.redb")
}
fn default_collision() -> String {
    "lww".to_string()
}
fn default_name() -> String {
    "orkv".to_string()
}
fn default_bind_port() -> u16 {
    7946
}
fn default_profile() -> String {
    "wan".to_string()
}
fn default_workers() -> usize {
    1
}
fn default_commit_buffer() -> usize {
    1
}
fn default_replica_buffer() -> usize {
    256
}
fn default_api_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

const COLLISION_POLICIES: &[&str] = &["", "none", "lww", "last_write_wins"];
const PROFILES: &[&str] = &["", "wan", "lan", "local"];

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peering.name.trim().is_empty() {
            return Err(ConfigError::Invalid("peering.name must not be empty".into()));
        }
        if self.peering.bind_port == u16::MAX {
            return Err(ConfigError::Invalid(format!(
                "peering.bind_port must be < {}: packets use bind_port + 1",
                u16::MAX
            )));
        }
        let profile = self.peering.profile.to_ascii_lowercase();
        if !PROFILES.contains(&profile.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "peering.profile {:?} is not one of wan, lan, local",
                self.peering.profile
            )));
        }
        if self.oplog.workers == 0 {
            return Err(ConfigError::Invalid("oplog.workers must be > 0".into()));
        }
        if self.oplog.commit_buffer == 0 {
            return Err(ConfigError::Invalid("oplog.commit_buffer must be > 0".into()));
        }
        let collision = self.server.collision.trim().to_lowercase();
        if !COLLISION_POLICIES.contains(&collision.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "server.collision {:?} is not one of none, lww",
                self.server.collision
            )));
        }
        Ok(())
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid(yaml: &str, mention: &str) {
        let err = load_from_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{}", err);
        assert!(
            err.to_string().contains(mention),
            "error should mention {}: {}",
            mention,
            err
        );
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = load_from_str("{}").unwrap();
        assert_eq!(config.server.db_path, PathBuf::from("orkv.redb"));
        assert_eq!(config.server.collision, "lww");
        assert_eq!(config.peering.name, "orkv");
        assert_eq!(config.peering.bind_port, 7946);
        assert!(config.peering.bind_addr.is_none());
        assert_eq!(config.oplog.workers, 1);
        assert_eq!(config.oplog.replica_buffer, 256);
        assert_eq!(config.api.bind.port(), 8080);
        assert!(config.metrics_port.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  db_path: /var/lib/orkv/node.redb
  collision: none
peering:
  name: edge
  bind_addr: 10.0.0.5
  bind_port: 9000
  advertise_address: 203.0.113.7
  advertise_port: 19000
  join:
    - "10.0.0.6:9000"
    - "seed.internal:9000"
  block: [rogue]
  profile: lan
  federation:
    node_name: edge-eu
    api_ingress: "https://edge.example.com"
    token: s3cret
oplog:
  workers: 4
  commit_buffer: 64
  replica_buffer: 0
  drain_on_stop: true
api:
  bind: "127.0.0.1:9080"
metrics_port: 9100
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.server.collision, "none");
        assert_eq!(config.peering.bind_addr, Some("10.0.0.5".parse().unwrap()));
        assert_eq!(config.peering.advertise_port, 19000);
        assert_eq!(config.peering.join.len(), 2);
        assert_eq!(config.peering.block, vec!["rogue".to_string()]);
        assert_eq!(config.peering.federation.node_name, "edge-eu");
        assert_eq!(config.oplog.workers, 4);
        assert_eq!(config.oplog.replica_buffer, 0);
        assert!(config.oplog.drain_on_stop);
        assert_eq!(config.api.bind.port(), 9080);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn test_roundtrip_yaml() {
        let yaml = r#"
peering:
  name: rt
  join: ["127.0.0.1:7000"]
"#;
        let config = load_from_str(yaml).unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let config2 = load_from_str(&serialized).unwrap();
        assert_eq!(config.peering.name, config2.peering.name);
        assert_eq!(config.peering.join, config2.peering.join);
        assert_eq!(config.api.bind, config2.api.bind);
    }

    #[test]
    fn test_rejects_empty_name() {
        invalid("peering:\n  name: \"  \"\n", "peering.name");
    }

    #[test]
    fn test_rejects_top_port() {
        invalid("peering:\n  bind_port: 65535\n", "peering.bind_port");
    }

    #[test]
    fn test_rejects_zero_workers() {
        invalid("oplog:\n  workers: 0\n", "oplog.workers");
    }

    #[test]
    fn test_rejects_zero_commit_buffer() {
        invalid("oplog:\n  commit_buffer: 0\n", "oplog.commit_buffer");
    }

    #[test]
    fn test_rejects_unknown_collision() {
        invalid("server:\n  collision: newest\n", "server.collision");
    }

    #[test]
    fn test_rejects_unknown_profile() {
        invalid("peering:\n  profile: metro\n", "peering.profile");
    }

    #[test]
    fn test_policy_case_insensitive() {
        let config = load_from_str("server:\n  collision: LWW\n").unwrap();
        assert_eq!(config.server.collision, "LWW");
    }

    #[test]
    fn test_bad_yaml() {
        assert!(matches!(
            load_from_str("peering: [unclosed"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = load_from_file(std::path::Path::new("/nonexistent/orkv.yaml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
