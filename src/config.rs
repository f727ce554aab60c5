//! Configuration system for treeway
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (TREEWAY_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::topology::Rank;

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TreewayConfig {
    /// This node's place in the tree
    pub node: NodeSettings,

    /// How nodes reach each other
    pub transport: TransportSettings,

    /// Waypoint tuning
    pub waypoint: WaypointSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Node identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// This node's rank, in [0, world_size)
    pub rank: Rank,

    /// Number of participants in the tree
    pub world_size: usize,
}

/// Transport backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process fabric; only meaningful for a single-process tree
    Local,
    /// One TCP listener per rank
    Tcp,
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(TransportKind::Local),
            "tcp" => Ok(TransportKind::Tcp),
            other => Err(Error::config_field_invalid(
                "transport.kind",
                format!("Unknown transport '{}'. Must be one of: local, tcp", other),
            )),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Local => write!(f, "local"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Backend to use
    pub kind: TransportKind,

    /// Listen address of every rank, indexed by rank (tcp only)
    pub peers: Vec<String>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Maximum connect attempts per peer (0 = until timeout)
    pub max_connect_attempts: u32,
}

/// Waypoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaypointSettings {
    /// Receive buffer size; larger inbound messages are dropped
    pub max_packet_bytes: usize,

    /// Pause between poll passes in microseconds (0 = yield only)
    pub idle_sleep_us: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            kind: TransportKind::Local,
            peers: vec![],
            connect_timeout_ms: 10000,
            max_connect_attempts: 0, // Until timeout
        }
    }
}

impl Default for WaypointSettings {
    fn default() -> Self {
        Self {
            max_packet_bytes: 1024 * 1024,
            idle_sleep_us: 100,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl WaypointSettings {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us)
    }
}

impl TreewayConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e.message()),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            } else {
                return Err(Error::config_not_found(path));
            }
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            PathBuf::from("treeway.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("treeway").join("config.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".treeway").join("config.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/treeway/config.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    pub(crate) fn apply_env_overrides(&mut self) {
        // Node settings
        if let Ok(val) = std::env::var("TREEWAY_RANK") {
            if let Ok(n) = val.parse() {
                self.node.rank = n;
            }
        }
        if let Ok(val) = std::env::var("TREEWAY_WORLD_SIZE") {
            if let Ok(n) = val.parse() {
                self.node.world_size = n;
            }
        }

        // Transport settings
        if let Ok(val) = std::env::var("TREEWAY_TRANSPORT") {
            if let Ok(kind) = val.parse() {
                self.transport.kind = kind;
            }
        }
        if let Ok(val) = std::env::var("TREEWAY_PEERS") {
            self.transport.peers = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(val) = std::env::var("TREEWAY_CONNECT_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.transport.connect_timeout_ms = n;
            }
        }

        // Waypoint settings
        if let Ok(val) = std::env::var("TREEWAY_MAX_PACKET_BYTES") {
            if let Ok(n) = val.parse() {
                self.waypoint.max_packet_bytes = n;
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("TREEWAY_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("TREEWAY_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("TREEWAY_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.world_size == 0 {
            return Err(Error::config_field_invalid(
                "node.world_size",
                "world_size must be at least 1",
            ));
        }
        if self.node.rank >= self.node.world_size {
            return Err(Error::config_field_invalid(
                "node.rank",
                format!(
                    "rank {} must be below world_size {}",
                    self.node.rank, self.node.world_size
                ),
            ));
        }

        if self.transport.kind == TransportKind::Tcp {
            if self.transport.peers.len() != self.node.world_size {
                return Err(Error::config_field_invalid(
                    "transport.peers",
                    format!(
                        "tcp transport needs one peer address per rank ({} given, world_size {})",
                        self.transport.peers.len(),
                        self.node.world_size
                    ),
                ));
            }
            self.peer_addrs()?;
        }

        if self.waypoint.max_packet_bytes == 0 {
            return Err(Error::config_field_invalid(
                "waypoint.max_packet_bytes",
                "max_packet_bytes must be greater than 0",
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Parsed peer addresses, indexed by rank
    pub fn peer_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.transport
            .peers
            .iter()
            .enumerate()
            .map(|(rank, addr)| {
                addr.parse().map_err(|e| {
                    Error::config_field_invalid(
                        format!("transport.peers[{}]", rank),
                        format!("'{}' is not a socket address: {}", addr, e),
                    )
                })
            })
            .collect()
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".treeway")
                .join("config.toml")
        });

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# treeway node configuration

[node]
# This node's rank, in [0, world_size)
rank = 0

# Number of participants in the tree
world_size = 1

[transport]
# Backend: "local" (single process) or "tcp"
kind = "local"

# Listen address of every rank, indexed by rank (tcp only)
# peers = ["10.0.0.1:7400", "10.0.0.2:7400", "10.0.0.3:7400"]
peers = []

# Connection timeout in milliseconds
connect_timeout_ms = 10000

# Maximum connect attempts per peer (0 = until timeout)
max_connect_attempts = 0

[waypoint]
# Receive buffer size in bytes; larger inbound messages are dropped
max_packet_bytes = 1048576

# Pause between poll passes in microseconds (0 = yield only)
idle_sleep_us = 100

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.treeway/logs/treeway.log"

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = TreewayConfig::default();
        assert_eq!(config.node.rank, 0);
        assert_eq!(config.node.world_size, 1);
        assert_eq!(config.transport.kind, TransportKind::Local);
        assert_eq!(config.waypoint.max_packet_bytes, 1024 * 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_override() {
        env::set_var("TREEWAY_RANK", "2");
        env::set_var("TREEWAY_WORLD_SIZE", "3");
        env::set_var("TREEWAY_TRANSPORT", "tcp");
        env::set_var("TREEWAY_PEERS", "127.0.0.1:7400, 127.0.0.1:7401,127.0.0.1:7402");

        let mut config = TreewayConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.node.rank, 2);
        assert_eq!(config.node.world_size, 3);
        assert_eq!(config.transport.kind, TransportKind::Tcp);
        assert_eq!(config.transport.peers.len(), 3);
        assert_eq!(config.transport.peers[1], "127.0.0.1:7401");
        assert!(config.validate().is_ok());

        // Cleanup
        env::remove_var("TREEWAY_RANK");
        env::remove_var("TREEWAY_WORLD_SIZE");
        env::remove_var("TREEWAY_TRANSPORT");
        env::remove_var("TREEWAY_PEERS");
    }

    #[test]
    fn test_validation_rank_out_of_range() {
        let mut config = TreewayConfig::default();
        config.node.rank = 1;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { field: Some(ref f), .. } if f == "node.rank"));
    }

    #[test]
    fn test_validation_zero_world_size() {
        let mut config = TreewayConfig::default();
        config.node.world_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_tcp_needs_all_peers() {
        let mut config = TreewayConfig::default();
        config.node.world_size = 3;
        config.transport.kind = TransportKind::Tcp;
        config.transport.peers = vec!["127.0.0.1:7400".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bad_peer_address() {
        let mut config = TreewayConfig::default();
        config.node.world_size = 2;
        config.transport.kind = TransportKind::Tcp;
        config.transport.peers = vec!["127.0.0.1:7400".into(), "not-an-address".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("not-an-address"));
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = TreewayConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_valid_config() {
        let config = TreewayConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_path_expansion() {
        let mut config = TreewayConfig::default();
        config.logging.file = Some("~/logs/treeway.log".to_string());
        config.expand_paths();

        assert!(!config.logging.file.unwrap().contains('~'));
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("TCP".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert_eq!("local".parse::<TransportKind>().unwrap(), TransportKind::Local);
        assert!("udp".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_generated_config_parses() {
        let config: TreewayConfig = toml::from_str(&generate_default_config()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.waypoint.idle_sleep_us, 100);
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[node]
rank = 1
world_size = 3

[transport]
kind = "tcp"
peers = ["127.0.0.1:7400", "127.0.0.1:7401", "127.0.0.1:7402"]
max_connect_attempts = 5

[waypoint]
max_packet_bytes = 4096

[logging]
level = "debug"
"#;

        let config: TreewayConfig = toml::from_str(config_str).unwrap();

        assert_eq!(config.node.rank, 1);
        assert_eq!(config.transport.kind, TransportKind::Tcp);
        assert_eq!(config.transport.max_connect_attempts, 5);
        assert_eq!(config.transport.connect_timeout_ms, 10000);
        assert_eq!(config.waypoint.max_packet_bytes, 4096);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.peer_addrs().unwrap()[2].port(), 7402);
    }
}
