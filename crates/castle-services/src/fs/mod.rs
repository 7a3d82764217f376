//! Shared file systems and their metadata servers
//!
//! Admins declare a file system by name and pool prefix. The leader
//! creates its pools, picks the node that runs its metadata server and
//! asks the MDS agent there to start it.
//!
//! ```text
//! fs/{desired,applied}/<fs>/pool
//! mds/{desired,applied}/node/<node>/{id,filesystem}
//! ```

pub mod agent;
pub mod leader;

pub use agent::{MDS_AGENT, MdsAgent};
pub use leader::FilesystemLeader;

use castle_common::keys::{self, service};
use castle_common::{Error, Result};
use castle_kv::util::{delete_if_exists, get_tree_optional};
use castle_kv::{KvStore, path};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

const POOL: &str = "pool";
const ID: &str = "id";
const FILESYSTEM: &str = "filesystem";

/// A metadata server placed on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MdsAssignment {
    pub id: u32,
    pub filesystem: String,
}

fn mds_key(node_id: &str, applied: bool) -> String {
    path::join(&keys::mds_nodes(applied), node_id)
}

/// File system name to pool prefix
pub async fn load_filesystems(store: &dyn KvStore, applied: bool) -> Result<BTreeMap<String, String>> {
    let Some(tree) = get_tree_optional(store, &keys::service_state(service::FS, applied)).await? else {
        return Ok(BTreeMap::new());
    };
    Ok(tree
        .children
        .iter()
        .map(|fs| {
            (
                fs.name().to_string(),
                fs.child_value(POOL).unwrap_or_default().to_string(),
            )
        })
        .collect())
}

/// Node to metadata server
pub async fn load_mds(store: &dyn KvStore, applied: bool) -> Result<BTreeMap<String, MdsAssignment>> {
    let mut mds = BTreeMap::new();
    let Some(tree) = get_tree_optional(store, &keys::mds_nodes(applied)).await? else {
        return Ok(mds);
    };
    for node in &tree.children {
        let Some(id) = node.child_value(ID).and_then(|id| id.parse().ok()) else {
            warn!("Ignoring metadata server without a valid id on node {}", node.name());
            continue;
        };
        mds.insert(
            node.name().to_string(),
            MdsAssignment {
                id,
                filesystem: node.child_value(FILESYSTEM).unwrap_or_default().to_string(),
            },
        );
    }
    Ok(mds)
}

/// Declare file system `name` backed by pools prefixed with `pool`
pub async fn create_filesystem(store: &dyn KvStore, name: &str, pool: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::invalid_input(format!("invalid file system name {name:?}")));
    }
    if pool.is_empty() || pool.contains('/') {
        return Err(Error::invalid_input(format!("invalid pool name {pool:?}")));
    }
    let key = path::join(&keys::filesystem(name, false), POOL);
    store.set(&key, pool, None).await?;
    info!("Requested file system {} on pool {}", name, pool);
    Ok(())
}

/// Withdraw file system `name`; a missing one is not an error
pub async fn remove_filesystem(store: &dyn KvStore, name: &str) -> Result<()> {
    delete_if_exists(store, &keys::filesystem(name, false)).await?;
    info!("Requested removal of file system {}", name);
    Ok(())
}
