//! Operator requests
//!
//! Every request only records desired state. It returns [`Accepted`] once
//! the store took the write; the leader carries it out on a later pass and
//! the applied trees show when it is done.

use crate::fs::{self, MdsAssignment, load_filesystems, load_mds};
use crate::object::{self, load_gateways, object_store_enabled};
use castle_cluster::info::parse_monitors;
use castle_cluster::{ClusterInfo, MonitorEndpoint};
use castle_common::Result;
use castle_common::keys::{self, service};
use castle_device::desired;
use castle_inventory::Inventory;
use castle_kv::KvStore;
use castle_kv::util::get_tree_optional;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// The request was recorded as desired state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Accepted;

pub async fn create_filesystem(store: &dyn KvStore, name: &str, pool: &str) -> Result<Accepted> {
    fs::create_filesystem(store, name, pool).await?;
    Ok(Accepted)
}

pub async fn remove_filesystem(store: &dyn KvStore, name: &str) -> Result<Accepted> {
    fs::remove_filesystem(store, name).await?;
    Ok(Accepted)
}

pub async fn enable_object_store(store: &dyn KvStore) -> Result<Accepted> {
    object::enable_object_store(store).await?;
    Ok(Accepted)
}

pub async fn remove_object_store(store: &dyn KvStore) -> Result<Accepted> {
    object::remove_object_store(store).await?;
    Ok(Accepted)
}

/// Back an OSD with the disk `disk_uuid` of `node_id`
pub async fn add_desired_device(store: &dyn KvStore, node_id: &str, disk_uuid: &str) -> Result<Accepted> {
    desired::add_desired_device(store, node_id, disk_uuid).await?;
    Ok(Accepted)
}

pub async fn remove_desired_device(store: &dyn KvStore, node_id: &str, disk_uuid: &str) -> Result<Accepted> {
    desired::remove_desired_device(store, node_id, disk_uuid).await?;
    Ok(Accepted)
}

/// Back an OSD with directory `dir` of `node_id`
pub async fn add_desired_dir(store: &dyn KvStore, node_id: &str, dir: &str) -> Result<Accepted> {
    desired::add_desired_dir(store, node_id, dir).await?;
    Ok(Accepted)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub public_ip: String,
    pub healthy: bool,
}

/// What the cluster looks like from the store; secrets are left out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub fsid: Option<String>,
    pub name: Option<String>,
    pub nodes: BTreeMap<String, NodeStatus>,
    /// Applied monitors by node
    pub monitors: BTreeMap<String, MonitorEndpoint>,
    /// Applied OSD ids by node
    pub osds: BTreeMap<String, Vec<String>>,
    /// Applied file systems and their pool prefix
    pub filesystems: BTreeMap<String, String>,
    pub metadata_servers: BTreeMap<String, MdsAssignment>,
    pub object_store: bool,
    pub gateways: BTreeSet<String>,
}

pub async fn cluster_status(store: &dyn KvStore) -> Result<ClusterStatus> {
    let mut status = ClusterStatus::default();
    if let Some(info) = ClusterInfo::load(store).await? {
        status.fsid = Some(info.fsid);
        status.name = Some(info.name);
    }
    status.nodes = Inventory::load(store)
        .await?
        .nodes
        .into_iter()
        .map(|(id, node)| {
            let healthy = node.is_healthy();
            (
                id,
                NodeStatus {
                    public_ip: node.public_ip,
                    healthy,
                },
            )
        })
        .collect();

    if let Some(tree) = get_tree_optional(store, &keys::service_state(service::MONITOR, true)).await? {
        status.monitors = parse_monitors(&tree)?;
    }
    if let Some(tree) = get_tree_optional(store, &keys::service_state(service::OSD, true)).await? {
        status.osds = tree
            .children
            .iter()
            .map(|node| (node.name().to_string(), node.child_names().map(str::to_string).collect()))
            .collect();
    }
    status.filesystems = load_filesystems(store, true).await?;
    status.metadata_servers = load_mds(store, true).await?;
    status.object_store = object_store_enabled(store, true).await?;
    status.gateways = load_gateways(store, true).await?;
    Ok(status)
}
