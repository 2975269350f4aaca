//! Runtime configuration for the three gtstore roles.
//!
//! Configs deserialize from a json file or get assembled from `GTSTORE_*`
//! environment variables on top of the defaults, which is how the binaries
//! run when no config path is given.
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ring::NodeAddress;

pub const DEFAULT_MANAGER_HOST: &str = "127.0.0.1";
pub const DEFAULT_MANAGER_PORT: u16 = 5000;
pub const DEFAULT_STORAGE_HOST: &str = "127.0.0.1";
pub const DEFAULT_STORAGE_BASE_PORT: u16 = 6000;

/// Per-request bounds shared by clients and storage nodes.
pub const MAX_KEY_BYTES: usize = 20;
pub const MAX_VALUE_BYTES: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ManagerConfig {
    pub host: String,
    pub port: u16,
    pub replication_factor: usize,
    /// How often the monitor scans for silent storage nodes.
    pub detection_interval_ms: u64,
    /// A node whose last heartbeat is older than this is expired.
    pub failure_timeout_ms: u64,
    /// Bounded availability-wait before rebalancing moves keys. On
    /// exhaustion the manager logs a warning and proceeds anyway.
    pub availability_attempts: u32,
    pub availability_delay_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_MANAGER_HOST.to_string(),
            port: DEFAULT_MANAGER_PORT,
            replication_factor: 2,
            detection_interval_ms: 2000,
            failure_timeout_ms: 6000,
            availability_attempts: 30,
            availability_delay_ms: 200,
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = env("GTSTORE_MANAGER_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("GTSTORE_MANAGER_PORT") {
            config.port = port;
        }
        if let Some(replication_factor) = env_parse::<usize>("GTSTORE_REPL") {
            config.replication_factor = replication_factor.max(1);
        }
        config
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|err| Error::BadFormat {
            reason: format!("invalid manager config: {}", err),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct StorageConfig {
    pub host: String,
    pub port: u16,
    pub node_id: String,
    pub manager_host: String,
    pub manager_port: u16,
    pub heartbeat_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let pid = std::process::id();
        Self {
            host: DEFAULT_STORAGE_HOST.to_string(),
            // pid-derived offset so several nodes on one machine don't collide
            port: DEFAULT_STORAGE_BASE_PORT + (pid % 1000) as u16,
            node_id: format!("node{}", pid),
            manager_host: DEFAULT_MANAGER_HOST.to_string(),
            manager_port: DEFAULT_MANAGER_PORT,
            heartbeat_interval_ms: 2000,
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = env("GTSTORE_STORAGE_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("GTSTORE_STORAGE_PORT") {
            config.port = port;
        }
        if let Some(label) = env("GTSTORE_NODE_LABEL") {
            config.node_id = label;
        }
        if let Some(host) = env("GTSTORE_MANAGER_HOST") {
            config.manager_host = host;
        }
        if let Some(port) = env_parse("GTSTORE_MANAGER_PORT") {
            config.manager_port = port;
        }
        config
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|err| Error::BadFormat {
            reason: format!("invalid storage config: {}", err),
        })
    }

    pub fn manager_addr(&self) -> NodeAddress {
        NodeAddress {
            host: self.manager_host.clone(),
            port: self.manager_port,
        }
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env(name).and_then(|value| value.parse().ok())
}
