//! The agent capability

use crate::context::AgentContext;
use async_trait::async_trait;
use castle_common::Result;

/// A per-node worker owning one kind of local daemon
#[async_trait]
pub trait Agent: Send + Sync {
    /// Name used in the notification key
    fn name(&self) -> &str;

    /// Prepare the node for this agent. Runs once at startup and must be
    /// idempotent.
    async fn initialize(&self, ctx: &AgentContext) -> Result<()>;

    /// Bring local daemons in line with the desired state for this node
    async fn reconcile_local(&self, ctx: &AgentContext) -> Result<()>;

    /// Stop every daemon this agent runs on the node
    async fn destroy_local(&self, ctx: &AgentContext) -> Result<()>;
}
