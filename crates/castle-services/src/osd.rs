//! OSD leader: asks nodes with desired OSDs to configure them

use crate::leader::{LeaderContext, ServiceLeader};
use async_trait::async_trait;
use castle_agent::trigger_and_wait;
use castle_common::keys::{self, service};
use castle_common::Result;
use castle_device::OSD_AGENT;
use castle_kv::util::get_tree_optional;
use castle_kv::TxnOp;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Subtrees of `osd/desired/<node>` that describe OSDs
const OSD_SOURCES: &[&str] = &["device", "dir"];

/// Agents that must succeed out of `n` notified: a majority plus one,
/// capped at `n`
#[must_use]
pub const fn osd_threshold(n: usize) -> usize {
    let wanted = n.div_ceil(2) + 1;
    if wanted < n { wanted } else { n }
}

/// Nodes in the inventory with at least one desired device or directory,
/// plus nodes that just joined
pub async fn nodes_to_configure(ctx: &LeaderContext) -> Result<Vec<String>> {
    let mut nodes = BTreeSet::new();
    if let Some(tree) = get_tree_optional(ctx.store.as_ref(), &keys::service_state(service::OSD, false)).await? {
        for node in &tree.children {
            let wants_osds = OSD_SOURCES
                .iter()
                .filter_map(|source| node.child(source))
                .any(|source| !source.children.is_empty());
            if wants_osds {
                nodes.insert(node.name().to_string());
            }
        }
    }
    nodes.extend(ctx.added_nodes.iter().cloned());
    Ok(nodes
        .into_iter()
        .filter(|node| ctx.inventory.get(node).is_some())
        .collect())
}

#[derive(Debug, Default)]
pub struct OsdLeader;

impl OsdLeader {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ServiceLeader for OsdLeader {
    fn name(&self) -> &str {
        service::OSD
    }

    fn refresh_keys(&self) -> Vec<String> {
        vec![keys::service_state(service::OSD, false)]
    }

    async fn configure(&self, ctx: &LeaderContext) -> Result<()> {
        let nodes = nodes_to_configure(ctx).await?;
        if nodes.is_empty() {
            debug!("No nodes with desired osds");
            return Ok(());
        }

        let ops = nodes
            .iter()
            .map(|node| TxnOp::set(keys::osd_ready(node), "1"))
            .collect();
        ctx.store.transaction(ops).await?;

        info!("Configuring osds on nodes {:?}", nodes);
        let outcome = trigger_and_wait(
            ctx.store.as_ref(),
            &nodes,
            OSD_AGENT,
            osd_threshold(nodes.len()),
            ctx.agent_timeout(),
        )
        .await?;
        if !outcome.failed.is_empty() || !outcome.outstanding.is_empty() {
            info!(
                "Osd agents failed on {:?}, still running on {:?}",
                outcome.failed, outcome.outstanding
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::leader_context;
    use castle_agent::testing::{TestContext, answer_agents, answer_succeeded};
    use castle_common::Error;
    use castle_common::keys::STATUS_SUCCEEDED;
    use castle_device::desired::{add_desired_device, add_desired_dir};
    use castle_kv::KvStore;
    use castle_kv::util::get_optional;

    const NODES: &[(&str, &str)] = &[
        ("a", "1.2.3.4"),
        ("b", "2.3.4.5"),
        ("c", "3.4.5.6"),
        ("d", "4.5.6.7"),
    ];

    #[test]
    fn test_threshold() {
        assert_eq!(osd_threshold(0), 0);
        assert_eq!(osd_threshold(1), 1);
        assert_eq!(osd_threshold(2), 2);
        assert_eq!(osd_threshold(3), 3);
        assert_eq!(osd_threshold(4), 3);
        assert_eq!(osd_threshold(10), 6);
    }

    #[tokio::test]
    async fn test_nodes_with_desired_osds() {
        let t = TestContext::new("a");
        let mut ctx = leader_context(&t, NODES);
        add_desired_device(t.store.as_ref(), "a", "uuid-a").await.unwrap();
        add_desired_dir(t.store.as_ref(), "c", "/mnt/osd").await.unwrap();
        // only the ready flag, no OSDs
        t.store.set(&keys::osd_ready("b"), "1", None).await.unwrap();
        // not in the inventory
        add_desired_device(t.store.as_ref(), "gone", "uuid-x").await.unwrap();

        assert_eq!(nodes_to_configure(&ctx).await.unwrap(), vec!["a", "c"]);

        ctx.added_nodes.insert("d".to_string());
        assert_eq!(nodes_to_configure(&ctx).await.unwrap(), vec!["a", "c", "d"]);
    }

    #[tokio::test]
    async fn test_ready_and_triggered() {
        let t = TestContext::new("a");
        let ctx = leader_context(&t, NODES);
        add_desired_device(t.store.as_ref(), "a", "uuid-a").await.unwrap();
        add_desired_device(t.store.as_ref(), "b", "uuid-b").await.unwrap();
        let _agents = answer_succeeded(t.ctx.store.clone(), OSD_AGENT).await;

        OsdLeader::new().configure(&ctx).await.unwrap();

        for node in ["a", "b"] {
            assert_eq!(t.store.get(&keys::osd_ready(node)).await.unwrap(), "1");
            assert_eq!(
                t.store.get(&keys::notify_status(node, OSD_AGENT)).await.unwrap(),
                STATUS_SUCCEEDED
            );
        }
        assert_eq!(get_optional(t.store.as_ref(), &keys::osd_ready("c")).await.unwrap(), None);
    }

    async fn configure_with_failures(failing: &'static [&'static str]) -> Result<()> {
        let t = TestContext::new("a");
        let ctx = leader_context(&t, NODES);
        for (node, _) in NODES {
            add_desired_device(t.store.as_ref(), node, "uuid").await.unwrap();
        }
        let _agents = answer_agents(t.ctx.store.clone(), OSD_AGENT, move |node| {
            if failing.contains(&node) {
                "failed: no disks".to_string()
            } else {
                STATUS_SUCCEEDED.to_string()
            }
        })
        .await;
        OsdLeader::new().configure(&ctx).await
    }

    #[tokio::test]
    async fn test_threshold_tolerates_one_failure() {
        configure_with_failures(&["d"]).await.unwrap();
    }

    #[tokio::test]
    async fn test_threshold_not_met() {
        let err = configure_with_failures(&["c", "d"]).await.unwrap_err();
        assert!(matches!(err, Error::External { .. }));
    }
}
