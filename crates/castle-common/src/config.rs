//! Configuration types for castle
//!
//! This module defines the configuration loaded by `castled` and handed to
//! agents and the leader through their contexts.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default cluster name
pub const DEFAULT_CLUSTER_NAME: &str = "castlecluster";

/// Root configuration for castle
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity
    pub node: NodeConfig,
    /// Coordination store connection
    pub store: StoreConfig,
    /// Cluster-wide settings
    pub cluster: ClusterConfig,
    /// Local OSD provisioning
    pub osd: OsdConfig,
    /// Object gateway placement
    pub rgw: RgwConfig,
    /// Timers and deadlines
    pub timing: TimingConfig,
}

/// Node identity configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node identifier. When empty, the id persisted under the
    /// config dir is used (or generated on first start).
    pub id: String,
    /// Public IP address the monitors bind to
    pub public_ip: String,
    /// Private (cluster network) IP address
    pub private_ip: String,
    /// CRUSH location, comma separated `key=value` pairs
    pub location: String,
}

/// Coordination store backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store, useful for tests and single-node demos
    Memory,
    /// Process-local store persisted to a redb file
    #[default]
    Local,
    /// etcd v2 keys API
    Etcd,
}

/// Coordination store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend to use
    pub backend: StoreBackend,
    /// etcd endpoints (e.g., "http://10.0.0.1:2379")
    pub endpoints: Vec<String>,
    /// Database path for the local backend
    pub path: PathBuf,
    /// Request timeout in milliseconds for remote backends
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            path: PathBuf::from("/var/lib/castle/store.redb"),
            timeout_ms: 5000,
        }
    }
}

/// Cluster-wide configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Short human name of the cluster
    pub name: String,
    /// Externally supplied admin secret; generated when absent
    pub admin_secret: Option<String>,
    /// Root directory for configs, keyrings and daemon data
    pub config_dir: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CLUSTER_NAME.to_string(),
            admin_secret: None,
            config_dir: PathBuf::from("/var/lib/castle"),
        }
    }
}

/// On-device OSD layout
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    /// Write-ahead log + DB + block partitions
    #[default]
    Bluestore,
    /// Data partition with a journal file
    Filestore,
}

impl StoreType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bluestore => "bluestore",
            Self::Filestore => "filestore",
        }
    }
}

impl std::fmt::Display for StoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StoreType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bluestore" => Ok(Self::Bluestore),
            "filestore" => Ok(Self::Filestore),
            other => Err(crate::Error::invalid_input(format!("unknown store type '{other}'"))),
        }
    }
}

/// Local OSD provisioning configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OsdConfig {
    /// Devices to use for OSD data (device names, e.g. "sdb")
    pub devices: Vec<String>,
    /// Dedicated device for WAL/DB partitions of all OSDs on this node
    pub metadata_device: Option<String>,
    /// Directories to back directory-based OSDs
    pub directories: Vec<PathBuf>,
    /// Format devices even if they carry foreign partitions or a filesystem
    pub force_format: bool,
    /// On-device layout
    pub store_type: StoreType,
    /// WAL partition size; 0 selects the default
    pub wal_size_mb: u64,
    /// DB partition size; 0 selects the default
    pub db_size_mb: u64,
    /// Filestore journal size; 0 selects the default
    pub journal_size_mb: u64,
}

impl Default for OsdConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            metadata_device: None,
            directories: Vec::new(),
            force_format: false,
            store_type: StoreType::Bluestore,
            wal_size_mb: 0,
            db_size_mb: 0,
            journal_size_mb: 0,
        }
    }
}

/// Object gateway configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RgwConfig {
    /// Number of gateways; `None` places one per node
    pub gateway_count: Option<usize>,
    /// Port the gateways listen on
    pub port: u16,
}

impl Default for RgwConfig {
    fn default() -> Self {
        Self {
            gateway_count: None,
            port: 53390,
        }
    }
}

/// Timers and deadlines
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// TTL of the node heartbeat key; refreshed every third of it
    pub heartbeat_ttl_secs: u64,
    /// TTL of the leader lease; renewed every third of it
    pub lease_ttl_secs: u64,
    /// Interval of the periodic leader refresh
    pub refresh_interval_secs: u64,
    /// Deadline for an agent notification round
    pub agent_timeout_secs: u64,
    /// Grace window between SIGTERM and SIGKILL when stopping daemons
    pub stop_grace_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: 30,
            lease_ttl_secs: 30,
            refresh_interval_secs: 60,
            agent_timeout_secs: 180,
            stop_grace_secs: 10,
        }
    }
}

impl TimingConfig {
    #[must_use]
    pub const fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    #[must_use]
    pub const fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cluster.name, DEFAULT_CLUSTER_NAME);
        assert_eq!(config.store.backend, StoreBackend::Local);
        assert_eq!(config.osd.store_type, StoreType::Bluestore);
        assert_eq!(config.rgw.gateway_count, None);
        assert_eq!(config.timing.heartbeat_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [node]
            id = "node-a"
            public_ip = "10.0.0.1"

            [osd]
            devices = ["sdb", "sdc"]
            store_type = "filestore"

            [rgw]
            gateway_count = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.node.id, "node-a");
        assert_eq!(config.osd.devices, vec!["sdb", "sdc"]);
        assert_eq!(config.osd.store_type, StoreType::Filestore);
        assert_eq!(config.rgw.gateway_count, Some(1));
        assert_eq!(config.rgw.port, 53390);
        assert_eq!(config.cluster.config_dir, PathBuf::from("/var/lib/castle"));
    }

    #[test]
    fn test_store_type_parse() {
        assert_eq!("bluestore".parse::<StoreType>().unwrap(), StoreType::Bluestore);
        assert!("zfs".parse::<StoreType>().unwrap_err().to_string().contains("zfs"));
    }
}
