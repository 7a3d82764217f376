//! Node inventory in the coordination store

use crate::disk::{DiskType, LocalDisk};
use castle_common::keys;
use castle_common::Result;
use castle_kv::{KvNode, KvStore, TxnOp, path, util};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Heartbeat age past which a node may not host a monitor
pub const UNHEALTHY_AGE: Duration = Duration::from_secs(10);
/// Age assumed for a node that never sent a heartbeat
pub const MISSING_HEARTBEAT_AGE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const PUBLIC_IP: &str = "publicIp";
const PRIVATE_IP: &str = "privateIp";
const LOCATION: &str = "location";
const DISKS: &str = "disks";

/// What the leader knows about a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub public_ip: String,
    pub private_ip: String,
    pub location: String,
    pub disks: Vec<LocalDisk>,
    pub heartbeat_age: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            public_ip: String::new(),
            private_ip: String::new(),
            location: String::new(),
            disks: Vec::new(),
            heartbeat_age: MISSING_HEARTBEAT_AGE,
        }
    }
}

impl NodeConfig {
    /// Fit to host a monitor: heartbeat no older than [`UNHEALTHY_AGE`]
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.heartbeat_age <= UNHEALTHY_AGE
    }
}

/// All nodes, keyed (and iterated) by node id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub nodes: BTreeMap<String, NodeConfig>,
}

impl Inventory {
    /// Load every node config and its heartbeat age
    pub async fn load(store: &dyn KvStore) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        if let Some(tree) = util::get_tree_optional(store, keys::NODES_CONFIG).await? {
            for node in &tree.children {
                nodes.insert(node.name().to_string(), parse_node(node));
            }
        }

        if let Some(health) = util::get_tree_optional(store, keys::NODES_HEALTH).await? {
            let now = Utc::now();
            for node in &health.children {
                let Some(config) = nodes.get_mut(node.name()) else {
                    warn!("Found health but no config for node {}", node.name());
                    continue;
                };
                if let Some(beat) = node.child_value("heartbeat") {
                    config.heartbeat_age = heartbeat_age(beat, now);
                }
            }
        }
        Ok(Self { nodes })
    }

    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<&NodeConfig> {
        self.nodes.get(node_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }
}

fn heartbeat_age(value: &str, now: DateTime<Utc>) -> Duration {
    match DateTime::parse_from_rfc3339(value) {
        Ok(ts) => (now - ts.with_timezone(&Utc)).to_std().unwrap_or(Duration::ZERO),
        Err(e) => {
            warn!("Unparsable heartbeat '{}': {}", value, e);
            MISSING_HEARTBEAT_AGE
        }
    }
}

fn parse_node(node: &KvNode) -> NodeConfig {
    let value = |name: &str| node.child_value(name).unwrap_or_default().to_string();
    let disks = node
        .child(DISKS)
        .map(|d| d.children.iter().map(parse_disk).collect())
        .unwrap_or_default();
    NodeConfig {
        public_ip: value(PUBLIC_IP),
        private_ip: value(PRIVATE_IP),
        location: value(LOCATION),
        disks,
        heartbeat_age: MISSING_HEARTBEAT_AGE,
    }
}

fn parse_disk(node: &KvNode) -> LocalDisk {
    let value = |name: &str| node.child_value(name).unwrap_or_default().to_string();
    LocalDisk {
        name: node.name().to_string(),
        size: value("size").parse().unwrap_or_default(),
        uuid: value("uuid"),
        filesystem: value("filesystem"),
        mountpoint: value("mountpoint"),
        disk_type: DiskType::from(value("type").as_str()),
        parent: value("parent"),
        has_children: value("haschildren") == "true",
        readonly: value("readonly") == "true",
    }
}

/// Publish the addresses of a node
pub async fn set_ip_address(
    store: &dyn KvStore,
    node_id: &str,
    public_ip: &str,
    private_ip: &str,
) -> Result<()> {
    let base = keys::node_config(node_id);
    store
        .transaction(vec![
            TxnOp::set(path::join(&base, PUBLIC_IP), public_ip),
            TxnOp::set(path::join(&base, PRIVATE_IP), private_ip),
        ])
        .await?;
    Ok(())
}

pub async fn set_location(store: &dyn KvStore, node_id: &str, location: &str) -> Result<()> {
    let key = path::join(&keys::node_config(node_id), LOCATION);
    store.set(&key, location, None).await?;
    Ok(())
}

/// Replace the published disks of a node
pub async fn store_disks(store: &dyn KvStore, node_id: &str, disks: &[LocalDisk]) -> Result<()> {
    let root = path::join(&keys::node_config(node_id), DISKS);
    util::delete_if_exists(store, &root).await?;
    let mut ops = Vec::new();
    for disk in disks {
        let base = path::join(&root, &disk.name);
        let props = [
            ("uuid", disk.uuid.clone()),
            ("size", disk.size.to_string()),
            ("type", disk.disk_type.as_str().to_string()),
            ("parent", disk.parent.clone()),
            ("filesystem", disk.filesystem.clone()),
            ("mountpoint", disk.mountpoint.clone()),
            ("readonly", disk.readonly.to_string()),
            ("haschildren", disk.has_children.to_string()),
        ];
        ops.extend(
            props
                .into_iter()
                .map(|(name, value)| TxnOp::set(path::join(&base, name), value)),
        );
    }
    if ops.is_empty() {
        store.create_dir(&root).await?;
    } else {
        store.transaction(ops).await?;
    }
    Ok(())
}

/// Load the disks a node published
pub async fn load_disks(store: &dyn KvStore, node_id: &str) -> Result<Vec<LocalDisk>> {
    let root = path::join(&keys::node_config(node_id), DISKS);
    Ok(util::get_tree_optional(store, &root)
        .await?
        .map(|tree| tree.children.iter().map(parse_disk).collect())
        .unwrap_or_default())
}
