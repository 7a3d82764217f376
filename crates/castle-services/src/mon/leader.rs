//! Monitor placement, quorum and the initial CRUSH map

use super::agent::MON_AGENT;
use super::{MON_PORT, monitor_properties};
use crate::leader::{LeaderContext, ServiceLeader};
use async_trait::async_trait;
use castle_agent::{majority, trigger_and_wait};
use castle_cluster::commands::{create_default_crush_rule, mon_remove, mon_status};
use castle_cluster::conf::generate_admin_connection_config;
use castle_cluster::info::{load_monitors, parse_monitors};
use castle_cluster::{ClusterConnection, ClusterInfo, MonitorEndpoint};
use castle_common::keys::{self, service};
use castle_common::{Error, Result};
use castle_inventory::Inventory;
use castle_kv::util::{delete_if_exists, get_optional, get_tree_optional};
use castle_kv::{TxnOp, path};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the replicated rule created with the initial CRUSH map
pub const DEFAULT_CRUSH_RULE: &str = "castle-default";
const CRUSH_INITIALIZED: &str = "crushMapInitialized";
/// Highest monitor index ever handed out
const MONITOR_HIGH_WATER: &str = "monitorHighWater";

const QUORUM_ATTEMPTS: u32 = 20;
const QUORUM_INTERVAL: Duration = Duration::from_secs(5);
/// Unhealthy monitors are likely down; do not wait on them for long
const REMOVAL_DEADLINE: Duration = Duration::from_secs(10);

/// Monitors wanted for a cluster of `nodes` nodes
#[must_use]
pub const fn monitor_count(nodes: usize) -> usize {
    match nodes {
        0 => 0,
        1..=2 => 1,
        3..=20 => 3,
        21..=100 => 5,
        _ => 7,
    }
}

fn monitor_index(name: &str) -> Result<u32> {
    name.strip_prefix("mon")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| Error::invalid_input(format!("unexpected monitor name '{name}'")))
}

/// Index for the next new monitor: one past the highest in use, and never
/// below `floor`
pub fn next_monitor_index(monitors: &BTreeMap<String, MonitorEndpoint>, floor: u32) -> Result<u32> {
    let mut next = floor;
    for mon in monitors.values() {
        next = next.max(monitor_index(&mon.name)? + 1);
    }
    Ok(next)
}

/// Monitor placement decided for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorPlan {
    /// Every monitor once the plan is applied, by node
    pub monitors: BTreeMap<String, MonitorEndpoint>,
    pub added: BTreeMap<String, MonitorEndpoint>,
    /// Monitors on nodes unfit to keep them
    pub removed: BTreeMap<String, MonitorEndpoint>,
    /// Index the next plan starts numbering from
    pub next_index: u32,
}

impl MonitorPlan {
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    #[must_use]
    pub fn nodes(&self) -> Vec<String> {
        self.monitors.keys().cloned().collect()
    }
}

/// Pick the nodes for new monitors and the monitors to drop.
///
/// Monitors on nodes that are gone or unhealthy are replaced; candidates
/// come in inventory order and must be healthy and reachable. Nothing
/// changes unless every needed replacement can be placed.
pub fn plan_monitors(
    inventory: &Inventory,
    current: &BTreeMap<String, MonitorEndpoint>,
    floor: u32,
) -> Result<MonitorPlan> {
    let target = monitor_count(inventory.len());
    let removed: BTreeMap<_, _> = current
        .iter()
        .filter(|(node, _)| !inventory.get(node).is_some_and(|n| n.is_healthy()))
        .map(|(node, mon)| (node.clone(), mon.clone()))
        .collect();
    let mut plan = MonitorPlan {
        monitors: current.clone(),
        next_index: next_monitor_index(current, floor)?,
        ..MonitorPlan::default()
    };

    let wanted = (target + removed.len()).saturating_sub(current.len());
    info!(
        "Monitor state: current={}, target={}, unhealthy={}, to add={}",
        current.len(),
        target,
        removed.len(),
        wanted
    );
    if wanted == 0 {
        return Ok(plan);
    }

    for (node_id, node) in &inventory.nodes {
        if plan.added.len() == wanted {
            break;
        }
        if current.contains_key(node_id) {
            continue;
        }
        if !node.is_healthy() {
            info!("Skipping unhealthy node {} as a monitor (age {:?})", node_id, node.heartbeat_age);
            continue;
        }
        if node.public_ip.is_empty() {
            warn!("Skipping node {} as a monitor: no public ip", node_id);
            continue;
        }
        let mon = MonitorEndpoint::new(
            format!("mon{}", plan.next_index),
            format!("{}:{MON_PORT}", node.public_ip),
        );
        plan.next_index += 1;
        plan.added.insert(node_id.clone(), mon);
    }

    if plan.added.len() < wanted {
        return Err(Error::precondition(format!(
            "only found {} of {} healthy nodes for new monitors",
            plan.added.len(),
            wanted
        )));
    }
    for node in removed.keys() {
        plan.monitors.remove(node);
    }
    plan.monitors.extend(plan.added.clone());
    plan.removed = removed;
    Ok(plan)
}

/// Places monitors and keeps them in quorum
#[derive(Debug, Clone)]
pub struct MonitorLeader {
    quorum_attempts: u32,
    quorum_interval: Duration,
}

impl Default for MonitorLeader {
    fn default() -> Self {
        Self {
            quorum_attempts: QUORUM_ATTEMPTS,
            quorum_interval: QUORUM_INTERVAL,
        }
    }
}

impl MonitorLeader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_quorum_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.quorum_attempts = attempts;
        self.quorum_interval = interval;
        self
    }

    /// Poll until every monitor is in the monitor map and in quorum
    pub async fn wait_for_quorum(&self, conn: &dyn ClusterConnection, info: &ClusterInfo) -> Result<()> {
        let names = info.monitor_names();
        let mut missing = names.clone();
        for attempt in 1..=self.quorum_attempts {
            match mon_status(conn).await {
                Ok(status) => {
                    missing = names
                        .iter()
                        .filter(|name| !status.in_quorum(name))
                        .cloned()
                        .collect();
                    if missing.is_empty() {
                        info!("Monitors {:?} are in quorum", names);
                        return Ok(());
                    }
                    debug!("Monitors {:?} not yet in quorum (attempt {})", missing, attempt);
                }
                Err(e) => warn!("Failed to read monitor status (attempt {}): {}", attempt, e),
            }
            if attempt < self.quorum_attempts {
                tokio::time::sleep(self.quorum_interval).await;
            }
        }
        Err(Error::timeout(format!(
            "monitors {missing:?} not in quorum after {} attempts",
            self.quorum_attempts
        )))
    }
}

async fn applied_monitors(ctx: &LeaderContext) -> Result<BTreeMap<String, MonitorEndpoint>> {
    match get_tree_optional(ctx.store.as_ref(), &keys::service_state(service::MONITOR, true)).await? {
        Some(tree) => parse_monitors(&tree),
        None => Ok(BTreeMap::new()),
    }
}

async fn crush_initialized(ctx: &LeaderContext) -> Result<bool> {
    Ok(get_optional(ctx.store.as_ref(), &keys::cluster_value(CRUSH_INITIALIZED))
        .await?
        .as_deref()
        == Some("1"))
}

async fn create_initial_crush_map(ctx: &LeaderContext, conn: &dyn ClusterConnection) -> Result<()> {
    if crush_initialized(ctx).await? {
        return Ok(());
    }
    info!("Creating the initial crush map");
    create_default_crush_rule(conn, DEFAULT_CRUSH_RULE).await?;
    ctx.store
        .set(&keys::cluster_value(CRUSH_INITIALIZED), "1", None)
        .await?;
    Ok(())
}

/// Write the new placement and drop the replaced monitors in one step
async fn store_plan(ctx: &LeaderContext, plan: &MonitorPlan) -> Result<()> {
    let mut ops = Vec::new();
    for (node, mon) in &plan.added {
        info!("Placing monitor {} on node {} at {}", mon.name, node, mon.endpoint);
        let root = keys::monitor_node(node, false);
        ops.extend(
            monitor_properties(mon)
                .into_iter()
                .map(|(name, value)| TxnOp::set(path::join(&root, &name), value)),
        );
    }
    for (node, mon) in &plan.removed {
        info!("Removing monitor {} on node {} from desired state", mon.name, node);
        ops.push(TxnOp::delete_tree(keys::monitor_node(node, false)));
    }
    ops.push(TxnOp::set(
        keys::cluster_value(MONITOR_HIGH_WATER),
        plan.next_index.to_string(),
    ));
    ctx.store.transaction(ops).await?;
    Ok(())
}

/// Ask the replaced monitors to stop, then purge them from the monitor map
async fn remove_from_quorum(
    ctx: &LeaderContext,
    conn: &dyn ClusterConnection,
    removed: &BTreeMap<String, MonitorEndpoint>,
) -> Result<()> {
    let nodes: Vec<String> = removed.keys().cloned().collect();
    trigger_and_wait(ctx.store.as_ref(), &nodes, MON_AGENT, 0, REMOVAL_DEADLINE).await?;

    info!("Removing {} monitors from quorum", removed.len());
    for (node, mon) in removed {
        match mon_remove(conn, &mon.name).await {
            Err(e) if !e.is_not_found() => {
                return Err(e.context(format!("removing monitor {}", mon.name)));
            }
            _ => info!("Removed monitor {}", mon.name),
        }
        delete_if_exists(ctx.store.as_ref(), &keys::monitor_node(node, true)).await?;
    }
    Ok(())
}

#[async_trait]
impl ServiceLeader for MonitorLeader {
    fn name(&self) -> &str {
        service::MONITOR
    }

    async fn configure(&self, ctx: &LeaderContext) -> Result<()> {
        ctx.bootstrap().await?;
        info!("Configuring monitors with {} nodes available", ctx.inventory.len());

        let store = ctx.store.as_ref();
        let current = load_monitors(store).await?;
        let floor = get_optional(store, &keys::cluster_value(MONITOR_HIGH_WATER))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let plan = plan_monitors(&ctx.inventory, &current, floor)?;
        if plan.monitors.is_empty() {
            return Ok(());
        }
        if plan.is_unchanged()
            && applied_monitors(ctx).await? == plan.monitors
            && crush_initialized(ctx).await?
        {
            debug!("Monitors are up to date");
            return Ok(());
        }
        if !plan.is_unchanged() {
            store_plan(ctx, &plan).await?;
        }

        let nodes = plan.nodes();
        trigger_and_wait(store, &nodes, MON_AGENT, majority(nodes.len()), ctx.agent_timeout()).await?;

        let info = ctx.cluster_info().await?;
        let conn = ctx.admin_connection(&info).await?;
        let result: Result<()> = async {
            self.wait_for_quorum(conn.as_ref(), &info).await?;
            generate_admin_connection_config(&info, ctx.config_dir())?;
            create_initial_crush_map(ctx, conn.as_ref()).await?;
            if !plan.removed.is_empty()
                && let Err(e) = remove_from_quorum(ctx, conn.as_ref(), &plan.removed).await
            {
                warn!("Failed to remove monitors from quorum: {}", e);
            }
            Ok(())
        }
        .await;
        conn.shutdown().await;
        result
    }
}
