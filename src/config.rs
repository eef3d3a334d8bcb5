//! Node configuration
//!
//! Loaded from a JSON file. Missing keys fall back to [`NodeConfig::default`],
//! so a config file only needs the settings that differ from it.

use crate::cluster::{MembershipConfig, P2pTransportConfig};
use crate::gc::GcConfig;
use crate::metadata::{BootstrapOptions, DEFAULT_RETENTION_SECS};
use crate::storage::ErasureConfig;
use crate::{Result, ShardVaultError};

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration of one storage node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique server name in the cluster roster
    pub server_name: String,

    /// Host other nodes dial to reach this one
    pub hostname: String,

    pub port: u16,

    /// Root of the metadata database and the fragment directory
    pub data_path: String,

    /// Storage offered to the cluster (in bytes)
    pub storage_offered_bytes: u64,

    /// libp2p listen addresses; empty means all interfaces on `port`
    pub listen_addresses: Vec<String>,

    /// Requested erasure parameters, clamped on bootstrap
    pub layout: ErasureConfig,

    /// Age after which superseded versions are retired (seconds)
    pub retention_secs: i64,

    pub super_user: String,

    pub gc: GcConfig,

    /// Seconds between automatic collector runs; 0 disables them
    pub gc_interval_secs: u64,

    /// Seconds between retention sweeps; 0 disables them
    pub retention_interval_secs: u64,

    pub registration_attempts: u32,
    pub registration_backoff_ms: u64,
    pub heartbeat_interval_secs: u64,

    /// Concurrent liveness probes during registration
    pub probe_width: usize,

    /// Timeout of one fragment request to a peer (seconds)
    pub request_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_name: "node1".to_string(),
            hostname: "127.0.0.1".to_string(),
            port: 7400,
            data_path: "./shardvault_data".to_string(),
            storage_offered_bytes: 10 * 1024 * 1024 * 1024, // 10 GB
            listen_addresses: vec![],
            layout: ErasureConfig::default(),
            retention_secs: DEFAULT_RETENTION_SECS,
            super_user: "admin".to_string(),
            gc: GcConfig::default(),
            gc_interval_secs: 3600,
            retention_interval_secs: 24 * 3600,
            registration_attempts: 30,
            registration_backoff_ms: 500,
            heartbeat_interval_secs: 30,
            probe_width: 10,
            request_timeout_secs: 30,
        }
    }
}

impl NodeConfig {
    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ShardVaultError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: NodeConfig = serde_json::from_str(&raw)
            .map_err(|e| ShardVaultError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        crate::metadata::validate_name("server name", &self.server_name)
            .map_err(|e| ShardVaultError::Config(e.to_string()))?;
        crate::metadata::validate_name("super-user name", &self.super_user)
            .map_err(|e| ShardVaultError::Config(e.to_string()))?;

        if self.hostname.trim().is_empty() {
            return Err(ShardVaultError::Config("hostname is empty".into()));
        }
        if self.data_path.trim().is_empty() {
            return Err(ShardVaultError::Config("data path is empty".into()));
        }
        if self.storage_offered_bytes == 0 {
            return Err(ShardVaultError::Config("no storage offered".into()));
        }
        if self.retention_secs < 0 {
            return Err(ShardVaultError::Config(format!(
                "retention {} is negative",
                self.retention_secs
            )));
        }
        if self.gc.worker_width == 0 {
            return Err(ShardVaultError::Config("gc worker width must be at least 1".into()));
        }
        if self.registration_attempts == 0 {
            return Err(ShardVaultError::Config("registration needs at least one attempt".into()));
        }
        if self.heartbeat_interval_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ShardVaultError::Config(
                "heartbeat interval and request timeout must be positive".into(),
            ));
        }
        self.listen_multiaddrs()?;
        Ok(())
    }

    pub fn metadata_path(&self) -> PathBuf {
        Path::new(&self.data_path).join("metadata")
    }

    pub fn fragments_path(&self) -> PathBuf {
        Path::new(&self.data_path).join("fragments")
    }

    pub fn key_path(&self) -> PathBuf {
        Path::new(&self.data_path).join("node.key")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn listen_multiaddrs(&self) -> Result<Vec<Multiaddr>> {
        if self.listen_addresses.is_empty() {
            let fallback = format!("/ip4/0.0.0.0/tcp/{}", self.port);
            return fallback
                .parse()
                .map(|addr| vec![addr])
                .map_err(|e| ShardVaultError::Config(format!("{}: {}", fallback, e)));
        }
        self.listen_addresses
            .iter()
            .map(|raw| {
                raw.parse::<Multiaddr>()
                    .map_err(|e| ShardVaultError::Config(format!("listen address {}: {}", raw, e)))
            })
            .collect()
    }

    pub fn bootstrap_options(&self) -> BootstrapOptions {
        BootstrapOptions {
            super_user: self.super_user.clone(),
            layout: self.layout,
            retention_secs: self.retention_secs,
        }
    }

    pub fn membership_config(&self) -> MembershipConfig {
        MembershipConfig {
            registration_attempts: self.registration_attempts,
            registration_backoff: Duration::from_millis(self.registration_backoff_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            probe_width: self.probe_width.max(1),
            ..Default::default()
        }
    }

    pub fn transport_config(&self) -> Result<P2pTransportConfig> {
        Ok(P2pTransportConfig {
            listen_addresses: self.listen_multiaddrs()?,
            key_path: self.key_path(),
            request_timeout: self.request_timeout(),
            idle_timeout: Duration::from_secs(60),
        })
    }
}
