//! Places object gateways while the object store is enabled

use super::{
    ENABLED, RGW_AGENT, RGW_ENTITY, forget_gateway, gateway_key, keyring_key, load_gateways,
    object_store_enabled,
};
use crate::leader::{LeaderContext, ServiceLeader};
use async_trait::async_trait;
use castle_agent::trigger_and_wait;
use castle_cluster::commands::auth_get_or_create_key;
use castle_cluster::keyring::entity_keyring;
use castle_common::keys::{self, service};
use castle_common::Result;
use castle_kv::{TxnOp, path};
use castle_kv::util::{delete_if_exists, get_optional};
use std::collections::BTreeSet;
use tracing::{debug, info};

const RGW_CAPS: &[&str] = &["osd", "allow rwx", "mon", "allow rw"];

#[derive(Debug, Default)]
pub struct ObjectStoreLeader;

impl ObjectStoreLeader {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Gateway nodes for this pass: nodes that already host one come first,
/// the rest of the inventory fills up to the configured count
pub fn plan_gateways(ctx: &LeaderContext, current: &BTreeSet<String>) -> BTreeSet<String> {
    let nodes = ctx.inventory.len();
    let count = ctx.config.rgw.gateway_count.unwrap_or(nodes).min(nodes);
    let kept = current.iter().filter(|node| ctx.inventory.get(node).is_some());
    let added = ctx
        .inventory
        .node_ids()
        .filter(|node| !current.contains(*node))
        .map(str::to_string);
    kept.cloned().chain(added).take(count).collect()
}

/// Create the gateway key once and keep its keyring in the store
async fn ensure_keyring(ctx: &LeaderContext) -> Result<()> {
    if get_optional(ctx.store.as_ref(), &keyring_key()).await?.is_some() {
        return Ok(());
    }
    let info = ctx.cluster_info().await?;
    let conn = ctx.admin_connection(&info).await?;
    let key = auth_get_or_create_key(conn.as_ref(), RGW_ENTITY, RGW_CAPS).await;
    conn.shutdown().await;
    ctx.store
        .set(&keyring_key(), &entity_keyring(RGW_ENTITY, &key?), None)
        .await?;
    info!("Created the object gateway keyring");
    Ok(())
}

async fn enable(ctx: &LeaderContext, planned: &BTreeSet<String>) -> Result<()> {
    ensure_keyring(ctx).await?;

    let desired = load_gateways(ctx.store.as_ref(), false).await?;
    let applied = load_gateways(ctx.store.as_ref(), true).await?;
    let mut ops: Vec<TxnOp> = planned
        .iter()
        .map(|node| TxnOp::set(gateway_key(node, false), ENABLED))
        .collect();
    ops.extend(
        desired
            .difference(planned)
            .map(|node| TxnOp::delete_tree(path::parent(&gateway_key(node, false)))),
    );
    ctx.store.transaction(ops).await?;

    let nodes: Vec<String> = planned.union(&applied).cloned().collect();
    info!("Placing object gateways on nodes {:?}", planned);
    trigger_and_wait(ctx.store.as_ref(), &nodes, RGW_AGENT, nodes.len(), ctx.agent_timeout()).await?;

    for node in applied.difference(planned) {
        forget_gateway(ctx.store.as_ref(), node).await?;
    }
    let mut ops: Vec<TxnOp> = planned
        .iter()
        .map(|node| TxnOp::set(gateway_key(node, true), ENABLED))
        .collect();
    ops.push(TxnOp::set(keys::object_state(true), ENABLED));
    ctx.store.transaction(ops).await?;
    info!("Object store is ready");
    Ok(())
}

async fn disable(ctx: &LeaderContext) -> Result<()> {
    delete_if_exists(ctx.store.as_ref(), &keys::rgw_nodes(false)).await?;
    let nodes: Vec<String> = load_gateways(ctx.store.as_ref(), true)
        .await?
        .into_iter()
        .collect();
    info!("Stopping object gateways on nodes {:?}", nodes);
    trigger_and_wait(ctx.store.as_ref(), &nodes, RGW_AGENT, nodes.len(), ctx.agent_timeout()).await?;

    delete_if_exists(ctx.store.as_ref(), &keys::service_state(service::RGW, true)).await?;
    delete_if_exists(ctx.store.as_ref(), &keys::service_state(service::OBJECT, true)).await?;
    info!("Object store removed");
    Ok(())
}

#[async_trait]
impl ServiceLeader for ObjectStoreLeader {
    fn name(&self) -> &str {
        service::OBJECT
    }

    fn refresh_keys(&self) -> Vec<String> {
        vec![keys::service_state(service::OBJECT, false)]
    }

    async fn configure(&self, ctx: &LeaderContext) -> Result<()> {
        let desired = object_store_enabled(ctx.store.as_ref(), false).await?;
        let applied = object_store_enabled(ctx.store.as_ref(), true).await?;

        if desired {
            let current = load_gateways(ctx.store.as_ref(), true).await?;
            let planned = plan_gateways(ctx, &current);
            if applied && planned == current {
                debug!("Object gateways are up to date");
                return Ok(());
            }
            if planned.is_empty() {
                debug!("No nodes for object gateways yet");
                return Ok(());
            }
            enable(ctx, &planned).await
        } else if applied {
            disable(ctx).await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{RgwAgent, enable_object_store, remove_object_store, rgw_endpoint};
    use crate::test_support::{leader_context, node, spawn_runner};
    use castle_agent::testing::{TestContext, answer_succeeded};
    use castle_kv::KvStore;
    use castle_kv::util::get_tree_optional;
    use serde_json::json;
    use std::sync::Arc;

    const NODES: &[(&str, &str)] = &[("a", "1.2.3.4"), ("b", "2.3.4.5")];

    fn set(nodes: &[&str]) -> BTreeSet<String> {
        nodes.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_plan_gateways() {
        let t = TestContext::new("a");
        let mut ctx = leader_context(&t, &[("a", "1"), ("b", "2"), ("c", "3")]);
        assert_eq!(plan_gateways(&ctx, &set(&[])), set(&["a", "b", "c"]));

        let mut config = (*ctx.config).clone();
        config.rgw.gateway_count = Some(2);
        ctx.config = Arc::new(config);
        assert_eq!(plan_gateways(&ctx, &set(&[])), set(&["a", "b"]));
        // placed gateways stay, gone nodes lose theirs
        assert_eq!(plan_gateways(&ctx, &set(&["c", "gone"])), set(&["a", "c"]));
    }

    #[tokio::test]
    async fn test_object_store_lifecycle() {
        let t = TestContext::new("a");
        t.seed_cluster().await;
        t.factory.on_json("auth get-or-create-key", json!({"key": "AQBrgw=="}));
        let ctx = leader_context(&t, NODES);
        let (node_a, sup_a) = node(&t, "a");
        let (node_b, sup_b) = node(&t, "b");
        let runners = [
            spawn_runner(node_a, Arc::new(RgwAgent::new())),
            spawn_runner(node_b, Arc::new(RgwAgent::new())),
        ];
        let leader = ObjectStoreLeader::new();

        enable_object_store(t.store.as_ref()).await.unwrap();
        leader.configure(&ctx).await.unwrap();

        assert_eq!(load_gateways(t.store.as_ref(), true).await.unwrap(), set(&["a", "b"]));
        assert!(object_store_enabled(t.store.as_ref(), true).await.unwrap());
        assert_eq!(sup_a.spawned(), vec!["rgw"]);
        assert_eq!(sup_b.spawned(), vec!["rgw"]);
        assert_eq!(
            t.store.get(&keyring_key()).await.unwrap(),
            "[client.radosgw.gateway]\n\tkey = AQBrgw==\n"
        );
        let auth = t.factory.calls_with_prefix("auth get-or-create-key");
        assert_eq!(auth.len(), 1);
        assert_eq!(auth[0].json["caps"], json!(RGW_CAPS));
        assert_eq!(
            rgw_endpoint(t.store.as_ref(), &ctx.inventory, 53390).await.unwrap().as_deref(),
            Some("1.2.3.4:53390")
        );

        // nothing diverges
        leader.configure(&ctx).await.unwrap();
        assert_eq!(sup_a.starts().len(), 1);

        remove_object_store(t.store.as_ref()).await.unwrap();
        leader.configure(&ctx).await.unwrap();

        assert_eq!(sup_a.stops(), vec!["rgw"]);
        assert_eq!(sup_b.stops(), vec!["rgw"]);
        assert!(!object_store_enabled(t.store.as_ref(), true).await.unwrap());
        for applied in [true, false] {
            for svc in [service::OBJECT, service::RGW] {
                assert!(get_tree_optional(t.store.as_ref(), &keys::service_state(svc, applied))
                    .await
                    .unwrap()
                    .is_none());
            }
        }
        // the keyring is kept for the next enable
        assert!(t.store.get(&keyring_key()).await.is_ok());

        for runner in runners {
            runner.abort();
        }
    }

    #[tokio::test]
    async fn test_new_node_gets_gateway() {
        let t = TestContext::new("a");
        t.seed_cluster().await;
        t.factory.on_json("auth get-or-create-key", json!({"key": "AQBrgw=="}));
        let _agents = answer_succeeded(t.ctx.store.clone(), RGW_AGENT).await;
        let leader = ObjectStoreLeader::new();

        enable_object_store(t.store.as_ref()).await.unwrap();
        leader.configure(&leader_context(&t, &NODES[..1])).await.unwrap();
        assert_eq!(load_gateways(t.store.as_ref(), true).await.unwrap(), set(&["a"]));

        leader.configure(&leader_context(&t, NODES)).await.unwrap();
        assert_eq!(load_gateways(t.store.as_ref(), true).await.unwrap(), set(&["a", "b"]));
        assert_eq!(t.factory.calls_with_prefix("auth get-or-create-key").len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_and_never_applied() {
        let t = TestContext::new("a");
        let ctx = leader_context(&t, NODES);
        ObjectStoreLeader::new().configure(&ctx).await.unwrap();
        assert!(t.factory.calls().is_empty());
    }
}
