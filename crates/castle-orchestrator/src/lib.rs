//! Castle Orchestrator - Leadership and the node runtime
//!
//! - [`election`]: the leader lease
//! - [`leader`]: the single-task leader loop that runs the service leaders
//! - [`watch`]: store watchers feeding that loop
//! - [`member`]: what every node runs, leader or not

pub mod election;
pub mod leader;
pub mod member;
pub mod watch;

pub use election::{Leadership, LeaseManager};
pub use leader::{Leader, LeaderEvent, LeaderHandle};
pub use member::ClusterMember;
