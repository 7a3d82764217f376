//! Shared fixtures for leader tests

use crate::leader::LeaderContext;
use castle_agent::testing::TestContext;
use castle_agent::{Agent, AgentContext, AgentRunner};
use castle_inventory::{Inventory, NodeConfig};
use castle_supervisor::testing::RecordingSupervisor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A healthy node reachable at `ip`
pub fn healthy(ip: &str) -> NodeConfig {
    NodeConfig {
        public_ip: ip.to_string(),
        heartbeat_age: Duration::ZERO,
        ..NodeConfig::default()
    }
}

pub fn inventory(nodes: &[(&str, &str)]) -> Inventory {
    Inventory {
        nodes: nodes
            .iter()
            .map(|(id, ip)| ((*id).to_string(), healthy(ip)))
            .collect(),
    }
}

/// Leader context over the store and fakes of `t`
pub fn leader_context(t: &TestContext, nodes: &[(&str, &str)]) -> LeaderContext {
    let mut ctx = LeaderContext::new(t.ctx.store.clone(), t.ctx.factory.clone(), t.ctx.config.clone());
    ctx.inventory = inventory(nodes);
    ctx
}

/// A peer node of `t` with its own supervisor
pub fn node(t: &TestContext, node_id: &str) -> (AgentContext, Arc<RecordingSupervisor>) {
    let supervisor = Arc::new(RecordingSupervisor::new());
    let ctx = AgentContext {
        supervisor: supervisor.clone(),
        ..t.peer(node_id)
    };
    (ctx, supervisor)
}

/// Run `agent` on `ctx` the way a node does
pub fn spawn_runner(ctx: AgentContext, agent: Arc<dyn Agent>) -> JoinHandle<()> {
    let runner = Arc::new(AgentRunner::new(ctx, vec![agent]));
    tokio::spawn(async move {
        let _ = runner.run().await;
    })
}
