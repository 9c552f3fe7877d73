//! Node configuration.
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./wharf.yaml` (current directory - highest priority)
//! 2. `~/.config/wharf/wharf.yaml` (user config directory)
//! 3. `/etc/wharf/wharf.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority
//! files. [`Config::into_server_config`] turns the loaded file into the
//! programmatic [`ServerConfig`] consumed by [`crate::Server`].

use crate::discovery::{NodeRecord, NodeRecordError, StaticTable};
use crate::identity::{Identity, IdentityError};
use crate::server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Default config filename.
const CONFIG_FILENAME: &str = "wharf.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("invalid node record: {0}")]
    NodeRecord(#[from] NodeRecordError),

    #[error("invalid listen address '{0}'")]
    InvalidListenAddr(String),
}

/// Node identity and naming (`node.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Hex-encoded secp256k1 secret key (`node.secret`). A fresh
    /// ephemeral keypair is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Node name advertised to peers (`node.name`).
    #[serde(default = "default_name")]
    pub name: String,

    /// Cosmetic suffix appended to the advertised name
    /// (`node.extra_data`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extra_data: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            secret: None,
            name: default_name(),
            extra_data: String::new(),
        }
    }
}

fn default_name() -> String {
    format!("wharf/v{}", env!("CARGO_PKG_VERSION"))
}

/// Peer-network settings (`network.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// TCP listen address (`network.listen_addr`). Empty disables
    /// inbound connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,

    /// Maximum number of non-exempt peers (`network.max_peers`).
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Target number of discovered peers (`network.min_connected_peers`).
    #[serde(default = "default_min_connected_peers")]
    pub min_connected_peers: usize,

    /// Cap on pre-admission inbound connections
    /// (`network.max_pending_peers`); zero selects the built-in default.
    #[serde(default)]
    pub max_pending_peers: usize,

    /// Whether dynamic peer discovery is enabled (`network.discovery`).
    #[serde(default = "default_true")]
    pub discovery: bool,

    /// Suppress all outbound dialing (`network.no_dial`).
    #[serde(default)]
    pub no_dial: bool,

    /// Nodes used to seed the discovery table
    /// (`network.bootstrap_nodes`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bootstrap_nodes: Vec<String>,

    /// Nodes kept connected at all times (`network.static_nodes`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_nodes: Vec<String>,

    /// Nodes admitted above the peer cap (`network.trusted_nodes`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted_nodes: Vec<String>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: None,
            max_peers: default_max_peers(),
            min_connected_peers: default_min_connected_peers(),
            max_pending_peers: 0,
            discovery: true,
            no_dial: false,
            bootstrap_nodes: Vec::new(),
            static_nodes: Vec::new(),
            trusted_nodes: Vec::new(),
        }
    }
}

fn default_max_peers() -> usize {
    25
}

fn default_min_connected_peers() -> usize {
    8
}

fn default_true() -> bool {
    true
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and naming (`node.*`).
    #[serde(default)]
    pub node: NodeSection,

    /// Peer-network settings (`network.*`).
    #[serde(default)]
    pub network: NetworkSection,
}

impl Config {
    /// Load configuration from the standard search paths.
    ///
    /// Files are loaded in reverse priority order and merged. Returns
    /// the merged config together with the paths that were actually
    /// loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        Self::load_from_paths(&Self::search_paths())
    }

    /// Load configuration from specific paths, later paths overriding
    /// earlier ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// The standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/wharf").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("wharf").join(CONFIG_FILENAME));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one. Values from `other`
    /// override values in `self` when present.
    pub fn merge(&mut self, other: Config) {
        if other.node.secret.is_some() {
            self.node.secret = other.node.secret;
        }
        if other.node.name != default_name() {
            self.node.name = other.node.name;
        }
        if !other.node.extra_data.is_empty() {
            self.node.extra_data = other.node.extra_data;
        }

        if other.network.listen_addr.is_some() {
            self.network.listen_addr = other.network.listen_addr;
        }
        if other.network.max_peers != default_max_peers() {
            self.network.max_peers = other.network.max_peers;
        }
        if other.network.min_connected_peers != default_min_connected_peers() {
            self.network.min_connected_peers = other.network.min_connected_peers;
        }
        if other.network.max_pending_peers != 0 {
            self.network.max_pending_peers = other.network.max_pending_peers;
        }
        if !other.network.discovery {
            self.network.discovery = false;
        }
        if other.network.no_dial {
            self.network.no_dial = true;
        }
        if !other.network.bootstrap_nodes.is_empty() {
            self.network.bootstrap_nodes = other.network.bootstrap_nodes;
        }
        if !other.network.static_nodes.is_empty() {
            self.network.static_nodes = other.network.static_nodes;
        }
        if !other.network.trusted_nodes.is_empty() {
            self.network.trusted_nodes = other.network.trusted_nodes;
        }
    }

    /// Whether an identity secret is configured.
    pub fn has_identity(&self) -> bool {
        self.node.secret.is_some()
    }

    /// Create the node identity from the configured secret, or generate
    /// an ephemeral one.
    pub fn create_identity(&self) -> Result<Identity, ConfigError> {
        match &self.node.secret {
            Some(secret) => Ok(Identity::from_secret_hex(secret)?),
            None => Ok(Identity::generate()),
        }
    }

    /// Build the programmatic server configuration.
    ///
    /// When discovery is enabled and bootstrap nodes are configured, a
    /// [`StaticTable`] seeded with them serves as the discovery table.
    pub fn into_server_config(self) -> Result<ServerConfig, ConfigError> {
        let identity = self.create_identity()?;
        let self_id = *identity.node_id();

        let mut server = ServerConfig::new(identity);
        server.name = self.node.name.clone();
        server.extra_data = self.node.extra_data.clone();
        server.max_peers = self.network.max_peers;
        server.min_connected_peers = self.network.min_connected_peers;
        server.max_pending_peers = self.network.max_pending_peers;
        server.no_dial = self.network.no_dial;
        server.static_nodes = parse_records(&self.network.static_nodes)?;
        server.trusted_nodes = parse_records(&self.network.trusted_nodes)?;

        if let Some(addr) = &self.network.listen_addr {
            // Validate early; the bind itself happens at start.
            if addr.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::InvalidListenAddr(addr.clone()));
            }
            server.listen_addr = Some(addr.clone());
        }

        if self.network.discovery {
            let bootstrap = parse_records(&self.network.bootstrap_nodes)?;
            if !bootstrap.is_empty() {
                // Endpoint information is refined once the listener is up;
                // the table only needs it for local_record queries.
                let local = match &server.listen_addr {
                    Some(addr) => {
                        let sock: SocketAddr = addr
                            .parse()
                            .map_err(|_| ConfigError::InvalidListenAddr(addr.clone()))?;
                        NodeRecord::new(self_id, sock.ip(), sock.port())
                    }
                    None => NodeRecord::unspecified(self_id),
                };
                server.discovery_table = Some(Arc::new(StaticTable::new(local, bootstrap)));
            }
        }

        Ok(server)
    }
}

fn parse_records(values: &[String]) -> Result<Vec<NodeRecord>, ConfigError> {
    values
        .iter()
        .map(|s| s.parse::<NodeRecord>().map_err(ConfigError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_string(port: u16) -> String {
        NodeRecord::new(
            *Identity::generate().node_id(),
            "10.0.0.1".parse().unwrap(),
            port,
        )
        .to_string()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.max_peers, 25);
        assert_eq!(config.network.min_connected_peers, 8);
        assert!(config.network.discovery);
        assert!(!config.has_identity());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = format!(
            r#"
node:
  name: "testnode"
network:
  listen_addr: "127.0.0.1:30303"
  max_peers: 10
  discovery: false
  static_nodes:
    - "{}"
"#,
            record_string(30301)
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.node.name, "testnode");
        assert_eq!(config.network.max_peers, 10);
        assert!(!config.network.discovery);
        assert_eq!(config.network.static_nodes.len(), 1);
    }

    #[test]
    fn test_merge_overrides() {
        let mut base = Config::default();
        base.network.max_peers = 10;

        let mut overlay = Config::default();
        overlay.node.secret = Some("ab".repeat(32));
        overlay.network.listen_addr = Some("0.0.0.0:30303".to_string());

        base.merge(overlay);
        assert!(base.has_identity());
        assert_eq!(base.network.listen_addr.as_deref(), Some("0.0.0.0:30303"));
        // Untouched fields survive the merge.
        assert_eq!(base.network.max_peers, 10);
    }

    #[test]
    fn test_into_server_config() {
        let mut config = Config::default();
        config.network.listen_addr = Some("127.0.0.1:0".to_string());
        config.network.static_nodes = vec![record_string(30301)];
        config.network.bootstrap_nodes = vec![record_string(30302)];

        let server = config.into_server_config().unwrap();
        assert_eq!(server.static_nodes.len(), 1);
        assert!(server.discovery_table.is_some());
        assert!(server.listen_addr.is_some());
    }

    #[test]
    fn test_discovery_off_drops_table() {
        let mut config = Config::default();
        config.network.discovery = false;
        config.network.bootstrap_nodes = vec![record_string(30302)];

        let server = config.into_server_config().unwrap();
        assert!(server.discovery_table.is_none());
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let mut config = Config::default();
        config.network.listen_addr = Some("nonsense".to_string());
        assert!(matches!(
            config.into_server_config(),
            Err(ConfigError::InvalidListenAddr(_))
        ));
    }

    #[test]
    fn test_invalid_static_node_rejected() {
        let mut config = Config::default();
        config.network.static_nodes = vec!["not-a-record".to_string()];
        assert!(matches!(
            config.into_server_config(),
            Err(ConfigError::NodeRecord(_))
        ));
    }

    #[test]
    fn test_configured_identity_is_stable() {
        let identity = Identity::generate();
        let mut config = Config::default();
        config.node.secret = Some(identity.secret_hex());

        let created = config.create_identity().unwrap();
        assert_eq!(created.node_id(), identity.node_id());
    }
}
