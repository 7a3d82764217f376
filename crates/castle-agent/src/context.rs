//! Everything an agent needs, passed explicitly

use castle_cluster::{ClusterInfo, ConnectionFactory};
use castle_common::Config;
use castle_common::Result;
use castle_inventory::LocalInventory;
use castle_kv::KvStore;
use castle_supervisor::{Executor, Supervisor};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared state of the agents on one node
#[derive(Clone)]
pub struct AgentContext {
    pub node_id: String,
    /// OS hostname, the default CRUSH host bucket
    pub hostname: String,
    pub config_dir: PathBuf,
    pub store: Arc<dyn KvStore>,
    pub supervisor: Arc<dyn Supervisor>,
    pub executor: Arc<dyn Executor>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub inventory: Arc<RwLock<LocalInventory>>,
    pub config: Arc<Config>,
}

impl AgentContext {
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Cluster identity, or `None` before the leader has bootstrapped it
    pub async fn cluster_info(&self) -> Result<Option<ClusterInfo>> {
        ClusterInfo::load(self.store.as_ref()).await
    }
}

/// Hostname of this machine, `None` when it cannot be read
#[must_use]
pub fn local_hostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}
