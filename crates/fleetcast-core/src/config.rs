//! Configuration management for fleetcast.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main configuration for a fleetcast node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Cluster configuration.
    pub cluster: ClusterConfig,
    /// SRT server configuration.
    pub srt: SrtConfig,
    /// RTMP advertisement configuration.
    pub rtmp: RtmpConfig,
    /// IAM configuration.
    pub iam: IamConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::new(crate::ErrorKind::InvalidArgument, e.to_string()))
    }
}

/// Cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Unique, stable id of this node.
    pub node_id: u64,
    /// Human-readable node name.
    pub name: String,
    /// Directory where raft state is kept.
    pub path: PathBuf,
    /// Listen address of the raft protocol. The cluster API listens on
    /// the same host at port + 1.
    pub raft_address: SocketAddr,
    /// Bootstrap a new cluster if no prior raft state exists.
    pub bootstrap: bool,
    /// Address of a cluster member to join instead of bootstrapping.
    pub join_address: Option<String>,
    /// Username for the cluster API of this node.
    pub username: String,
    /// Password for the cluster API of this node.
    pub password: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            name: "fleetcast".to_string(),
            path: PathBuf::from("./data/cluster"),
            raft_address: "127.0.0.1:7000".parse().expect("valid default address"),
            bootstrap: false,
            join_address: None,
            username: "cluster".to_string(),
            password: String::new(),
        }
    }
}

/// SRT server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SrtConfig {
    /// Enable the SRT server.
    pub enable: bool,
    /// The address the SRT server listens on, e.g. ":6000".
    pub address: String,
    /// Token required in the streamid. Empty = no token required.
    pub token: String,
    /// Passphrase for encrypted connections. Empty = encryption rejected.
    pub passphrase: String,
}

impl Default for SrtConfig {
    fn default() -> Self {
        Self {
            enable: false,
            address: ":6000".to_string(),
            token: String::new(),
            passphrase: String::new(),
        }
    }
}

/// RTMP advertisement configuration. The RTMP server itself lives outside
/// the cluster core; peers only need to know how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmpConfig {
    /// Enable RTMP advertisement.
    pub enable: bool,
    /// Plain RTMP listen address.
    pub address: String,
    /// TLS RTMP listen address.
    pub address_tls: String,
    /// Whether TLS is available.
    pub enable_tls: bool,
    /// Token required to play or publish. Empty = no token.
    pub token: String,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            enable: false,
            address: ":1935".to_string(),
            address_tls: ":1936".to_string(),
            enable_tls: false,
            token: String::new(),
        }
    }
}

/// IAM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IamConfig {
    /// Name of the bootstrap superuser identity.
    pub superuser_name: String,
    /// Password of the bootstrap superuser identity.
    pub superuser_password: String,
    /// Issuer put into locally issued JWTs.
    pub jwt_realm: String,
    /// HS256 secret for locally issued JWTs.
    pub jwt_secret: String,
    /// Optional flat list of users imported at startup.
    pub users_file: Option<PathBuf>,
}

impl Default for IamConfig {
    fn default() -> Self {
        Self {
            superuser_name: "admin".to_string(),
            superuser_password: String::new(),
            jwt_realm: "fleetcast".to_string(),
            jwt_secret: String::new(),
            users_file: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter, e.g. "info" or "fleetcast_consensus=debug".
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// JSON lines.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cluster.node_id, 1);
        assert_eq!(config.cluster.raft_address.port(), 7000);
        assert!(!config.cluster.bootstrap);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial() {
        let config = Config::parse(
            r#"
            [cluster]
            node_id = 2
            raft_address = "127.0.0.1:7100"
            bootstrap = true

            [srt]
            enable = true
            passphrase = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.cluster.node_id, 2);
        assert!(config.cluster.bootstrap);
        assert!(config.srt.enable);
        assert_eq!(config.srt.passphrase, "secret");
        // untouched sections keep their defaults
        assert_eq!(config.rtmp.address, ":1935");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Config::parse("cluster = 1").is_err());
    }
}
