//! Object store gateways
//!
//! A single flag enables the object store. The leader then places
//! gateways (one per node unless configured otherwise), creates the
//! gateway keyring once and asks the RGW agents to start `radosgw`.
//!
//! ```text
//! object/{desired,applied}/state
//! rgw/{desired,applied}/node/<node>/state
//! rgw/_secrets/keyring
//! ```

pub mod agent;
pub mod leader;

pub use agent::{RGW_AGENT, RgwAgent};
pub use leader::ObjectStoreLeader;

use castle_common::Result;
use castle_common::keys::{self, service};
use castle_inventory::Inventory;
use castle_kv::util::{delete_if_exists, get_optional, get_tree_optional};
use castle_kv::{KvStore, TxnOp, path};
use std::collections::BTreeSet;
use tracing::info;

/// Entity every gateway runs as
pub const RGW_ENTITY: &str = "client.radosgw.gateway";

const STATE: &str = "state";
const ENABLED: &str = "1";

fn keyring_key() -> String {
    keys::service_secret(service::RGW, "keyring")
}

fn gateway_key(node_id: &str, applied: bool) -> String {
    path::join(&path::join(&keys::rgw_nodes(applied), node_id), STATE)
}

/// Whether the object store is enabled in the desired or applied tree
pub async fn object_store_enabled(store: &dyn KvStore, applied: bool) -> Result<bool> {
    Ok(get_optional(store, &keys::object_state(applied)).await?.as_deref() == Some(ENABLED))
}

/// Nodes with a gateway
pub async fn load_gateways(store: &dyn KvStore, applied: bool) -> Result<BTreeSet<String>> {
    let Some(tree) = get_tree_optional(store, &keys::rgw_nodes(applied)).await? else {
        return Ok(BTreeSet::new());
    };
    Ok(tree
        .children
        .iter()
        .filter(|node| node.child_value(STATE) == Some(ENABLED))
        .map(|node| node.name().to_string())
        .collect())
}

pub async fn enable_object_store(store: &dyn KvStore) -> Result<()> {
    store.set(&keys::object_state(false), ENABLED, None).await?;
    info!("Requested the object store");
    Ok(())
}

/// Withdraw the object store and every gateway placement
pub async fn remove_object_store(store: &dyn KvStore) -> Result<()> {
    let mut ops = Vec::new();
    for key in [
        keys::service_state(service::OBJECT, false),
        keys::service_state(service::RGW, false),
    ] {
        if get_tree_optional(store, &key).await?.is_some() {
            ops.push(TxnOp::delete_tree(key));
        }
    }
    if !ops.is_empty() {
        store.transaction(ops).await?;
    }
    info!("Requested removal of the object store");
    Ok(())
}

/// `ip:port` of the first applied gateway
pub async fn rgw_endpoint(store: &dyn KvStore, inventory: &Inventory, port: u16) -> Result<Option<String>> {
    Ok(load_gateways(store, true)
        .await?
        .iter()
        .filter_map(|node| inventory.get(node))
        .find(|config| !config.public_ip.is_empty())
        .map(|config| format!("{}:{port}", config.public_ip)))
}

/// Drop the applied gateway entry of `node_id`
async fn forget_gateway(store: &dyn KvStore, node_id: &str) -> Result<()> {
    delete_if_exists(store, &path::parent(&gateway_key(node_id, true))).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::inventory;
    use castle_kv::MemoryStore;

    #[tokio::test]
    async fn test_enable_and_remove() {
        let store = MemoryStore::new();
        assert!(!object_store_enabled(&store, false).await.unwrap());
        remove_object_store(&store).await.unwrap();

        enable_object_store(&store).await.unwrap();
        store.set(&gateway_key("a", false), ENABLED, None).await.unwrap();
        assert!(object_store_enabled(&store, false).await.unwrap());
        assert_eq!(load_gateways(&store, false).await.unwrap().len(), 1);

        remove_object_store(&store).await.unwrap();
        assert!(!object_store_enabled(&store, false).await.unwrap());
        assert!(load_gateways(&store, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_endpoint() {
        let store = MemoryStore::new();
        let inv = inventory(&[("a", "1.2.3.4"), ("b", "2.3.4.5")]);
        assert_eq!(rgw_endpoint(&store, &inv, 53390).await.unwrap(), None);

        store.set(&gateway_key("b", true), ENABLED, None).await.unwrap();
        assert_eq!(
            rgw_endpoint(&store, &inv, 53390).await.unwrap().as_deref(),
            Some("2.3.4.5:53390")
        );

        forget_gateway(&store, "b").await.unwrap();
        assert_eq!(rgw_endpoint(&store, &inv, 53390).await.unwrap(), None);
    }
}
