//! TOML configuration for the state core.
//!
//! ```toml
//! [directory]
//! root_path = "/netvirt"
//!
//! [cache]
//! backend = "redis"
//! redis_host = "10.0.0.2"
//!
//! [nat]
//! lease_ttl_secs = 60
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::error::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Coordination-service layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Path under which all topology nodes live
    #[serde(default = "default_root_path")]
    pub root_path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process cache; bindings are not shared with other agents
    #[default]
    Local,
    /// Redis shared by all agents
    Redis,
}

/// Distributed cache connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Redis logical database number
    #[serde(default)]
    pub redis_db: i64,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

/// NAT lease behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatConfig {
    /// Lifetime of a binding that is not refreshed
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Age after which a slot reservation without a matching forward entry
    /// may be reclaimed by another allocation
    #[serde(default = "default_orphan_grace")]
    pub orphan_grace_secs: u64,

    /// Prefix of every cache key written by the lease manager
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Sort flow keys by kind before deriving cache keys
    #[serde(default)]
    pub canonicalize_flow_keys: bool,
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetvirtConfig {
    #[serde(default)]
    pub directory: DirectoryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub nat: NatConfig,
}

fn default_root_path() -> String {
    "/netvirt".to_string()
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_lease_ttl() -> u64 {
    60
}

fn default_orphan_grace() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "netvirt:nat".to_string()
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            redis_db: 0,
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

impl CacheConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: default_lease_ttl(),
            orphan_grace_secs: default_orphan_grace(),
            key_prefix: default_key_prefix(),
            canonicalize_flow_keys: false,
        }
    }
}

impl NatConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl_secs == 0 {
            return Err(StateError::invalid_config(
                "nat.lease_ttl_secs",
                "must be > 0",
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(StateError::invalid_config(
                "nat.key_prefix",
                "must not be empty",
            ));
        }
        Ok(())
    }
}

impl NetvirtConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| StateError::invalid_config("toml", e.to_string()))
    }

    /// Loads and validates the file at `path`.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content).map_err(|e| match e {
            StateError::InvalidConfig { message, .. } => {
                StateError::invalid_config(path.display().to_string(), message)
            }
            other => other,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load_from_file`](Self::load_from_file), but a missing file
    /// yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match Self::load_from_file(path) {
            Err(StateError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StateError::invalid_config("toml", e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.directory.root_path.starts_with('/') {
            return Err(StateError::invalid_config(
                "directory.root_path",
                "must be an absolute path",
            ));
        }
        if self.cache.backend == CacheBackend::Redis && self.cache.redis_port == 0 {
            return Err(StateError::invalid_config(
                "cache.redis_port",
                "must be > 0",
            ));
        }
        self.nat.validate()
    }
}
