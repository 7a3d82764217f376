//! Creates and removes file systems and places their metadata servers

use super::{FILESYSTEM, ID, MDS_AGENT, POOL, load_filesystems, load_mds, mds_key};
use crate::leader::{LeaderContext, ServiceLeader, ignore_not_found};
use async_trait::async_trait;
use castle_agent::trigger_and_wait;
use castle_cluster::ClusterConnection;
use castle_cluster::commands::{fs_get, fs_new, fs_rm, fs_set, mds_fail, pool_create};
use castle_common::keys::{self, service};
use castle_common::{Error, Result};
use castle_kv::util::delete_if_exists;
use castle_kv::{TxnOp, path};
use std::collections::BTreeSet;
use tracing::{debug, error, info};

/// Metadata servers per file system
const MDS_PER_FILESYSTEM: usize = 1;
/// Placement groups of each new pool
const POOL_PG_NUM: u32 = 100;

#[derive(Debug, Default)]
pub struct FilesystemLeader;

impl FilesystemLeader {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Create the pools and the file system unless it already exists
async fn ensure_filesystem(conn: &dyn ClusterConnection, name: &str, pool: &str) -> Result<()> {
    match fs_get(conn, name).await {
        Ok(_) => {
            debug!("File system {} already exists", name);
            return Ok(());
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    let data = format!("{pool}-data");
    let metadata = format!("{pool}-metadata");
    pool_create(conn, &data, POOL_PG_NUM).await?;
    pool_create(conn, &metadata, POOL_PG_NUM).await?;
    fs_new(conn, name, &metadata, &data).await?;
    info!("Created file system {} on pools {} and {}", name, metadata, data);
    Ok(())
}

/// Nodes hosting the metadata servers of `name`, placing new ones as needed
async fn place_mds(ctx: &LeaderContext, name: &str) -> Result<Vec<String>> {
    let desired = load_mds(ctx.store.as_ref(), false).await?;
    let mut nodes: Vec<String> = desired
        .iter()
        .filter(|(_, mds)| mds.filesystem == name)
        .map(|(node, _)| node.clone())
        .collect();
    if nodes.len() >= MDS_PER_FILESYSTEM {
        return Ok(nodes);
    }

    let taken: BTreeSet<&str> = desired.keys().map(String::as_str).collect();
    let candidates: Vec<&str> = ctx
        .inventory
        .nodes
        .iter()
        .filter(|(node, config)| !taken.contains(node.as_str()) && config.is_healthy())
        .map(|(node, _)| node.as_str())
        .take(MDS_PER_FILESYSTEM - nodes.len())
        .collect();
    if candidates.is_empty() && nodes.is_empty() {
        return Err(Error::precondition(format!(
            "no node is free to host a metadata server for file system {name}"
        )));
    }

    let mut next_id = desired.values().map(|mds| mds.id).max().map_or(1, |id| id + 1);
    let mut ops = Vec::new();
    for node in candidates {
        let root = mds_key(node, false);
        ops.push(TxnOp::set(path::join(&root, ID), next_id.to_string()));
        ops.push(TxnOp::set(path::join(&root, FILESYSTEM), name));
        info!("Placing metadata server {} of file system {} on node {}", next_id, name, node);
        next_id += 1;
        nodes.push(node.to_string());
    }
    ctx.store.transaction(ops).await?;
    Ok(nodes)
}

async fn enable(ctx: &LeaderContext, conn: &dyn ClusterConnection, name: &str, pool: &str) -> Result<()> {
    ensure_filesystem(conn, name, pool).await?;
    let nodes = place_mds(ctx, name).await?;
    trigger_and_wait(ctx.store.as_ref(), &nodes, MDS_AGENT, nodes.len(), ctx.agent_timeout()).await?;

    let desired = load_mds(ctx.store.as_ref(), false).await?;
    let mut ops = Vec::new();
    for node in &nodes {
        if let Some(mds) = desired.get(node) {
            let root = mds_key(node, true);
            ops.push(TxnOp::set(path::join(&root, ID), mds.id.to_string()));
            ops.push(TxnOp::set(path::join(&root, FILESYSTEM), name));
        }
    }
    ops.push(TxnOp::set(path::join(&keys::filesystem(name, true), POOL), pool));
    ctx.store.transaction(ops).await?;
    info!("File system {} is ready", name);
    Ok(())
}

async fn disable(ctx: &LeaderContext, conn: &dyn ClusterConnection, name: &str) -> Result<()> {
    ignore_not_found(fs_set(conn, name, "cluster_down", "true").await)?;
    match fs_get(conn, name).await {
        Ok(details) => {
            for mds in details.mdsmap.info.values() {
                ignore_not_found(mds_fail(conn, mds.gid).await)?;
            }
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    let ops: Vec<TxnOp> = load_mds(ctx.store.as_ref(), false)
        .await?
        .into_iter()
        .filter(|(_, mds)| mds.filesystem == name)
        .map(|(node, _)| TxnOp::delete_tree(mds_key(&node, false)))
        .collect();
    if !ops.is_empty() {
        ctx.store.transaction(ops).await?;
    }

    let nodes: Vec<String> = load_mds(ctx.store.as_ref(), true)
        .await?
        .into_iter()
        .filter(|(_, mds)| mds.filesystem == name)
        .map(|(node, _)| node)
        .collect();
    trigger_and_wait(ctx.store.as_ref(), &nodes, MDS_AGENT, nodes.len(), ctx.agent_timeout()).await?;
    if !nodes.is_empty() {
        let ops = nodes
            .iter()
            .map(|node| TxnOp::delete_tree(mds_key(node, true)))
            .collect();
        ctx.store.transaction(ops).await?;
    }

    ignore_not_found(fs_rm(conn, name).await)?;
    delete_if_exists(ctx.store.as_ref(), &keys::filesystem(name, true)).await?;
    info!("Removed file system {}", name);
    Ok(())
}

#[async_trait]
impl ServiceLeader for FilesystemLeader {
    fn name(&self) -> &str {
        service::FS
    }

    fn refresh_keys(&self) -> Vec<String> {
        vec![keys::service_state(service::FS, false)]
    }

    async fn configure(&self, ctx: &LeaderContext) -> Result<()> {
        let desired = load_filesystems(ctx.store.as_ref(), false).await?;
        let applied = load_filesystems(ctx.store.as_ref(), true).await?;
        let to_create: Vec<_> = desired.iter().filter(|(name, _)| !applied.contains_key(*name)).collect();
        let to_remove: Vec<_> = applied.keys().filter(|name| !desired.contains_key(*name)).collect();
        if to_create.is_empty() && to_remove.is_empty() {
            debug!("File systems are up to date");
            return Ok(());
        }

        let info = ctx.cluster_info().await?;
        let conn = ctx.admin_connection(&info).await?;
        let mut first_error = None;
        for (name, pool) in to_create {
            if let Err(e) = enable(ctx, conn.as_ref(), name, pool).await {
                error!("Failed to create file system {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        for name in to_remove {
            if let Err(e) = disable(ctx, conn.as_ref(), name).await {
                error!("Failed to remove file system {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        conn.shutdown().await;
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MdsAgent, MdsAssignment, create_filesystem, remove_filesystem};
    use crate::test_support::{leader_context, node, spawn_runner};
    use castle_agent::testing::{TestContext, answer_succeeded};
    use serde_json::json;
    use std::sync::Arc;

    const NODES: &[(&str, &str)] = &[("a", "1.2.3.4"), ("b", "2.3.4.5")];

    fn mds(id: u32) -> MdsAssignment {
        MdsAssignment {
            id,
            filesystem: "myfs".to_string(),
        }
    }

    fn fs_details(gid: u64) -> serde_json::Value {
        json!({
            "id": 1,
            "mdsmap": {
                "fs_name": "myfs",
                "info": {format!("gid_{gid}"): {"gid": gid, "name": "1", "state": "up:active"}}
            }
        })
    }

    #[tokio::test]
    async fn test_filesystem_lifecycle() {
        let t = TestContext::new("a");
        t.seed_cluster().await;
        t.factory.fail_not_found("fs get");
        t.factory.on_json("auth get-or-create-key", json!({"key": "AQBmds=="}));
        let ctx = leader_context(&t, NODES);
        let (node_a, sup_a) = node(&t, "a");
        let (node_b, sup_b) = node(&t, "b");
        let runners = [
            spawn_runner(node_a, Arc::new(MdsAgent::new())),
            spawn_runner(node_b, Arc::new(MdsAgent::new())),
        ];

        create_filesystem(t.store.as_ref(), "myfs", "yourpool").await.unwrap();
        let leader = FilesystemLeader::new();
        leader.configure(&ctx).await.unwrap();

        let pools: Vec<_> = t
            .factory
            .calls_with_prefix("osd pool create")
            .iter()
            .map(|c| c.json["pool"].clone())
            .collect();
        assert_eq!(pools, vec![json!("yourpool-data"), json!("yourpool-metadata")]);
        let fs_new = t.factory.calls_with_prefix("fs new");
        assert_eq!(fs_new.len(), 1);
        assert_eq!(fs_new[0].json["metadata"], "yourpool-metadata");

        let desired = load_mds(t.store.as_ref(), false).await.unwrap();
        let applied = load_mds(t.store.as_ref(), true).await.unwrap();
        assert_eq!(desired.len(), 1);
        assert_eq!(desired["a"], mds(1));
        assert_eq!(desired, applied);
        assert_eq!(load_filesystems(t.store.as_ref(), true).await.unwrap()["myfs"], "yourpool");
        assert_eq!(sup_a.spawned(), vec!["mds1"]);
        assert!(sup_b.starts().is_empty());

        // nothing diverges
        t.factory.clear_calls();
        leader.configure(&ctx).await.unwrap();
        assert!(t.factory.calls().is_empty());

        t.factory.on_json("fs get", fs_details(4101));
        remove_filesystem(t.store.as_ref(), "myfs").await.unwrap();
        leader.configure(&ctx).await.unwrap();

        assert_eq!(t.factory.calls_with_prefix("fs set")[0].json["var"], "cluster_down");
        assert_eq!(t.factory.calls_with_prefix("mds fail")[0].json["who"], "4101");
        assert_eq!(t.factory.calls_with_prefix("fs rm").len(), 1);
        assert!(load_mds(t.store.as_ref(), false).await.unwrap().is_empty());
        assert!(load_mds(t.store.as_ref(), true).await.unwrap().is_empty());
        assert!(load_filesystems(t.store.as_ref(), true).await.unwrap().is_empty());
        assert_eq!(sup_a.stops(), vec!["mds1"]);

        for runner in runners {
            runner.abort();
        }
    }

    #[tokio::test]
    async fn test_existing_filesystem_not_recreated() {
        let t = TestContext::new("a");
        t.seed_cluster().await;
        let ctx = leader_context(&t, NODES);
        let _agents = answer_succeeded(t.ctx.store.clone(), MDS_AGENT).await;

        create_filesystem(t.store.as_ref(), "myfs", "yourpool").await.unwrap();
        FilesystemLeader::new().configure(&ctx).await.unwrap();

        assert!(t.factory.calls_with_prefix("osd pool create").is_empty());
        assert!(t.factory.calls_with_prefix("fs new").is_empty());
        assert_eq!(load_mds(t.store.as_ref(), true).await.unwrap()["a"], mds(1));
    }

    #[tokio::test]
    async fn test_mds_ids_increase() {
        let t = TestContext::new("a");
        t.seed_cluster().await;
        let ctx = leader_context(&t, NODES);
        let _agents = answer_succeeded(t.ctx.store.clone(), MDS_AGENT).await;

        create_filesystem(t.store.as_ref(), "myfs", "p1").await.unwrap();
        create_filesystem(t.store.as_ref(), "zfs", "p2").await.unwrap();
        FilesystemLeader::new().configure(&ctx).await.unwrap();

        let applied = load_mds(t.store.as_ref(), true).await.unwrap();
        assert_eq!(applied["a"], mds(1));
        assert_eq!(applied["b"].id, 2);
        assert_eq!(applied["b"].filesystem, "zfs");
    }

    #[tokio::test]
    async fn test_no_free_node() {
        let t = TestContext::new("a");
        t.seed_cluster().await;
        let ctx = leader_context(&t, &[("a", "1.2.3.4")]);
        let _agents = answer_succeeded(t.ctx.store.clone(), MDS_AGENT).await;

        create_filesystem(t.store.as_ref(), "myfs", "p1").await.unwrap();
        create_filesystem(t.store.as_ref(), "zfs", "p2").await.unwrap();
        let err = FilesystemLeader::new().configure(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        // the first file system still came up
        let applied = load_filesystems(t.store.as_ref(), true).await.unwrap();
        assert_eq!(applied.keys().collect::<Vec<_>>(), vec!["myfs"]);
    }
}
