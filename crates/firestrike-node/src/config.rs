use anyhow::{Context, Result};
use firestrike_dht::{DEFAULT_FANOUT, MAX_PEERS, PEER_TIMEOUT_SECS, PING_INTERVAL_SECS};
use firestrike_protocol::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_MAX_OBJECT_BYTES};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default port a node listens on
pub const DEFAULT_PORT: u16 = 8789;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub dht: DhtConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
    #[serde(skip)]
    pub data_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Peers an upload pushes the object to
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    /// Bound on every outbound exchange (connect, send, receive)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Bound on a request or response header frame
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Largest object payload this node accepts or downloads
    #[serde(default = "default_max_object_bytes")]
    pub max_object_bytes: u64,
    /// How long stop() lets in-flight handlers finish
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_peers() -> usize {
    MAX_PEERS
}

fn default_peer_timeout() -> u64 {
    PEER_TIMEOUT_SECS
}

fn default_ping_interval() -> u64 {
    PING_INTERVAL_SECS
}

fn default_fanout() -> usize {
    DEFAULT_FANOUT
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_max_object_bytes() -> u64 {
    DEFAULT_MAX_OBJECT_BYTES
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            max_peers: default_max_peers(),
            peer_timeout_secs: default_peer_timeout(),
            ping_interval_secs: default_ping_interval(),
            fanout: default_fanout(),
            request_timeout_secs: default_request_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
            max_object_bytes: default_max_object_bytes(),
            shutdown_grace_secs: default_shutdown_grace(),
            bootstrap_nodes: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DhtConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Config {
    /// Default configuration using `data_dir` for node state
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Config {
            node: NodeConfig::default(),
            dht: DhtConfig::default(),
            logging: LoggingConfig::default(),
            config_file_path: PathBuf::new(),
            data_directory: data_dir.into(),
        }
    }

    /// Load configuration from file
    pub fn load(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read configuration file")?;

        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;

        config.config_file_path = config_path;
        config.data_directory = data_dir;

        Ok(config)
    }

    /// Create and save a new default configuration
    pub fn create_default(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&data_dir)?;

        let mut config = Config::with_data_dir(data_dir);
        config.config_file_path = config_path.clone();

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(&config_path, yaml)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        Ok(config)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Directory holding the content store
    pub fn store_directory(&self) -> PathBuf {
        self.data_directory.join("store")
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("firestrike")
            .join("config.yaml")
    }

    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("firestrike")
    }
}
