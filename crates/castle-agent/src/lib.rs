//! Castle Agent - Per-node workers
//!
//! The leader never talks to a node directly. It writes `trigger` to
//! `/castle/_notify/<node>/<agent>/status`; the [`AgentRunner`] on that node
//! sees the change, runs the agent's [`Agent::reconcile_local`] and writes
//! back `succeeded` or `failed: <reason>`. The leader side of the exchange
//! lives in [`notify`].

pub mod agent;
pub mod context;
pub mod guard;
pub mod notify;
pub mod runner;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use agent::Agent;
pub use context::AgentContext;
pub use guard::{ConfigGuard, ConfigHold};
pub use notify::{AgentOutcome, majority, trigger_agents, trigger_and_wait, wait_for_agents};
pub use runner::AgentRunner;
