//! Node side of the agent notification protocol

use crate::agent::Agent;
use crate::context::AgentContext;
use castle_common::keys::{self, STATUS_FAILED_PREFIX, STATUS_SUCCEEDED, STATUS_TRIGGER};
use castle_common::Result;
use castle_kv::{EventKind, util};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Runs the agents of one node on request.
///
/// Different agents run in parallel; requests for the same agent queue up
/// behind each other.
pub struct AgentRunner {
    ctx: AgentContext,
    agents: BTreeMap<String, (Arc<dyn Agent>, Arc<Mutex<()>>)>,
}

impl AgentRunner {
    pub fn new(ctx: AgentContext, agents: Vec<Arc<dyn Agent>>) -> Self {
        let agents = agents
            .into_iter()
            .map(|agent| (agent.name().to_string(), (agent, Arc::new(Mutex::new(())))))
            .collect();
        Self { ctx, agents }
    }

    #[must_use]
    pub const fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// Initialize every agent; failures are logged and do not stop the others
    pub async fn initialize(&self) {
        for (name, (agent, _)) in &self.agents {
            if let Err(e) = agent.initialize(&self.ctx).await {
                error!("Failed to initialize agent {}: {}", name, e);
            }
        }
    }

    /// Run one agent and write its status back
    pub async fn handle(&self, name: &str) -> Result<()> {
        let Some((agent, lock)) = self.agents.get(name) else {
            warn!("Notification for unknown agent {}", name);
            return Ok(());
        };
        let _serial = lock.lock().await;
        info!("Running agent {} on node {}", name, self.ctx.node_id);
        let status = match agent.reconcile_local(&self.ctx).await {
            Ok(()) => STATUS_SUCCEEDED.to_string(),
            Err(e) => {
                error!("Agent {} failed on node {}: {}", name, self.ctx.node_id, e);
                format!("{STATUS_FAILED_PREFIX}: {e}")
            }
        };
        self.ctx
            .store
            .set(&keys::notify_status(&self.ctx.node_id, name), &status, None)
            .await?;
        Ok(())
    }

    fn spawn_handle(self: &Arc<Self>, name: String) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = runner.handle(&name).await {
                warn!("Failed to report status of agent {}: {}", name, e);
            }
        });
    }

    /// Handle triggers written while nobody was watching
    async fn dispatch_pending(self: &Arc<Self>) -> Result<()> {
        for name in self.agents.keys() {
            let key = keys::notify_status(&self.ctx.node_id, name);
            if util::get_optional(self.ctx.store.as_ref(), &key).await?.as_deref() == Some(STATUS_TRIGGER) {
                self.spawn_handle(name.clone());
            }
        }
        Ok(())
    }

    fn agent_for_key(&self, key: &str) -> Option<String> {
        self.agents
            .keys()
            .find(|name| keys::notify_status(&self.ctx.node_id, name) == key)
            .cloned()
    }

    /// Watch this node's notification keys until the task is aborted
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let root = format!("{}/{}", keys::NOTIFY, self.ctx.node_id);
        let store = Arc::clone(&self.ctx.store);
        let mut index = store.current_index().await?;
        self.dispatch_pending().await?;

        loop {
            let mut watcher = match store.watch(&root, true, Some(index)).await {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!("Failed to watch {}: {}", root, e);
                    tokio::time::sleep(WATCH_RETRY_DELAY).await;
                    if let Ok(current) = store.current_index().await {
                        index = current;
                        if let Err(e) = self.dispatch_pending().await {
                            warn!("Failed to read pending notifications: {}", e);
                        }
                    }
                    continue;
                }
            };

            while let Some(item) = watcher.next().await {
                match item {
                    Ok(event) => {
                        index = event.index;
                        if event.kind == EventKind::Delete
                            || event.value.as_deref() != Some(STATUS_TRIGGER)
                        {
                            continue;
                        }
                        if let Some(name) = self.agent_for_key(&event.key) {
                            self.spawn_handle(name);
                        }
                    }
                    Err(e) => {
                        warn!("Watch on {} broke: {}", root, e);
                        break;
                    }
                }
            }
            index = index.max(watcher.last_index());
            tokio::time::sleep(WATCH_RETRY_DELAY).await;
        }
    }

    /// Stop every daemon on the node
    pub async fn destroy_all(&self) {
        for (name, (agent, lock)) in &self.agents {
            let _serial = lock.lock().await;
            if let Err(e) = agent.destroy_local(&self.ctx).await {
                warn!("Failed to stop daemons of agent {}: {}", name, e);
            }
        }
    }
}
