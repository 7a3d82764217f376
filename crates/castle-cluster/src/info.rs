//! Cluster bootstrap identity

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use castle_common::keys::{self, service};
use castle_common::{Error, Result};
use castle_kv::{KvNode, KvStore, StoreError, TxnOp, util};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

const FSID_KEY: &str = "fsid";
const NAME_KEY: &str = "name";
const MONITOR_SECRET: &str = "monitor";
const ADMIN_SECRET: &str = "admin";

/// Name and `ip:port` of a monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorEndpoint {
    pub name: String,
    pub endpoint: String,
}

impl MonitorEndpoint {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Persisted identity of the cluster.
///
/// Created once on first bootstrap; the secrets never change afterwards.
/// `monitors` is keyed by node id and derived from the desired monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub fsid: String,
    pub name: String,
    pub monitor_secret: String,
    pub admin_secret: String,
    pub monitors: BTreeMap<String, MonitorEndpoint>,
}

impl ClusterInfo {
    /// Load the cluster info; `None` until the cluster has been bootstrapped
    pub async fn load(store: &dyn KvStore) -> Result<Option<Self>> {
        let Some(fsid) = util::get_optional(store, &keys::cluster_value(FSID_KEY)).await? else {
            return Ok(None);
        };
        let name = store.get(&keys::cluster_value(NAME_KEY)).await?;
        let monitor_secret = store.get(&keys::cluster_secret(MONITOR_SECRET)).await?;
        let admin_secret = store.get(&keys::cluster_secret(ADMIN_SECRET)).await?;
        let monitors = load_monitors(store).await?;
        Ok(Some(Self {
            fsid,
            name,
            monitor_secret,
            admin_secret,
            monitors,
        }))
    }

    /// Load the cluster info, minting it on first use.
    ///
    /// Creation is guarded by a check that no fsid exists, so concurrent
    /// bootstraps agree on a single identity.
    pub async fn create_or_get(
        store: &dyn KvStore,
        name: &str,
        admin_secret: Option<&str>,
    ) -> Result<Self> {
        if let Some(info) = Self::load(store).await? {
            return Ok(info);
        }

        let fsid = uuid::Uuid::new_v4().to_string();
        let monitor_secret = generate_secret();
        let admin_secret = admin_secret.map_or_else(generate_secret, str::to_string);
        let ops = vec![
            TxnOp::check(keys::cluster_value(FSID_KEY), None),
            TxnOp::set(keys::cluster_value(FSID_KEY), fsid.clone()),
            TxnOp::set(keys::cluster_value(NAME_KEY), name),
            TxnOp::set(keys::cluster_secret(MONITOR_SECRET), monitor_secret),
            TxnOp::set(keys::cluster_secret(ADMIN_SECRET), admin_secret),
        ];
        match store.transaction(ops).await {
            Ok(_) => info!("Created cluster {} with fsid {}", name, fsid),
            Err(StoreError::Conflict { .. }) => {
                info!("Cluster info was created concurrently, loading it");
            }
            Err(e) => return Err(e.into()),
        }

        Self::load(store)
            .await?
            .ok_or_else(|| Error::unavailable("cluster info missing after creation"))
    }

    /// Monitor names, sorted
    #[must_use]
    pub fn monitor_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.monitors.values().map(|m| m.name.clone()).collect();
        names.sort();
        names
    }
}

/// Monitor endpoints from the desired monitor tree
pub async fn load_monitors(store: &dyn KvStore) -> Result<BTreeMap<String, MonitorEndpoint>> {
    let root = keys::service_state(service::MONITOR, false);
    let Some(tree) = util::get_tree_optional(store, &root).await? else {
        return Ok(BTreeMap::new());
    };
    parse_monitors(&tree)
}

/// Parse `<node>/{id,ipaddress,port}` entries
pub fn parse_monitors(tree: &KvNode) -> Result<BTreeMap<String, MonitorEndpoint>> {
    let mut monitors = BTreeMap::new();
    for node in &tree.children {
        let field = |name: &str| {
            node.child_value(name).ok_or_else(|| {
                Error::invalid_input(format!("monitor on node {} is missing {name}", node.name()))
            })
        };
        let id = field("id")?;
        let ip = field("ipaddress")?;
        let port = field("port")?;
        monitors.insert(
            node.name().to_string(),
            MonitorEndpoint::new(id, format!("{ip}:{port}")),
        );
    }
    Ok(monitors)
}

/// A fresh secret in the ceph key encoding: type, creation time and 16
/// random bytes, base64 encoded
#[must_use]
pub fn generate_secret() -> String {
    let now = chrono::Utc::now();
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);

    let mut buf = Vec::with_capacity(28);
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&u32::try_from(now.timestamp()).unwrap_or(u32::MAX).to_le_bytes());
    buf.extend_from_slice(&now.timestamp_subsec_nanos().to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    buf.extend_from_slice(&key);
    STANDARD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_kv::MemoryStore;

    #[test]
    fn test_generate_secret() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        let raw = STANDARD.decode(&a).unwrap();
        assert_eq!(raw.len(), 28);
        assert_eq!(&raw[..2], &[1, 0]);
        assert_eq!(&raw[10..12], &[16, 0]);
    }

    #[tokio::test]
    async fn test_load_before_bootstrap() {
        let store = MemoryStore::new();
        assert!(ClusterInfo::load(&store).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_or_get_is_stable() {
        let store = MemoryStore::new();
        let first = ClusterInfo::create_or_get(&store, "c1", Some("given")).await.unwrap();
        assert_eq!(first.admin_secret, "given");
        assert_eq!(first.name, "c1");

        let second = ClusterInfo::create_or_get(&store, "other", None).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_monitors_from_desired_state() {
        let store = MemoryStore::new();
        ClusterInfo::create_or_get(&store, "c1", None).await.unwrap();
        let base = keys::monitor_node("a", false);
        store.set(&format!("{base}/id"), "mon0", None).await.unwrap();
        store.set(&format!("{base}/ipaddress"), "1.2.3.4", None).await.unwrap();
        store.set(&format!("{base}/port"), "6790", None).await.unwrap();

        let info = ClusterInfo::load(&store).await.unwrap().unwrap();
        assert_eq!(info.monitors["a"], MonitorEndpoint::new("mon0", "1.2.3.4:6790"));
        assert_eq!(info.monitor_names(), vec!["mon0"]);

        store.delete(&format!("{base}/port"), false).await.unwrap();
        let err = ClusterInfo::load(&store).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
