//! Castle Services - Storage services on top of the agent runtime
//!
//! Each service has a leader half ([`ServiceLeader`]) that decides
//! placement and writes desired state, and an agent half
//! ([`castle_agent::Agent`]) that runs the daemons on a node.
//!
//! | Service | Leader | Agent |
//! |---|---|---|
//! | monitors | [`MonitorLeader`] | [`MonitorAgent`] |
//! | OSDs | [`OsdLeader`] | [`castle_device::OsdAgent`] |
//! | file systems | [`FilesystemLeader`] | [`MdsAgent`] |
//! | object store | [`ObjectStoreLeader`] | [`RgwAgent`] |

pub mod admin;
pub mod fs;
pub mod leader;
pub mod mon;
pub mod object;
pub mod osd;
#[cfg(test)]
mod test_support;

pub use admin::{Accepted, ClusterStatus, cluster_status};
pub use fs::{FilesystemLeader, MdsAgent};
pub use leader::{LeaderContext, ServiceLeader};
pub use mon::{MonitorAgent, MonitorLeader};
pub use object::{ObjectStoreLeader, RgwAgent, rgw_endpoint};
pub use osd::OsdLeader;

use castle_agent::Agent;
use castle_device::OsdAgent;
use std::sync::Arc;

/// Service leaders in the order a pass runs them. Later services need the
/// earlier ones: OSDs need a monitor quorum, file systems and gateways
/// need OSDs.
#[must_use]
pub fn leaders() -> Vec<Arc<dyn ServiceLeader>> {
    vec![
        Arc::new(MonitorLeader::new()),
        Arc::new(OsdLeader::new()),
        Arc::new(FilesystemLeader::new()),
        Arc::new(ObjectStoreLeader::new()),
    ]
}

/// Agents every node runs
#[must_use]
pub fn agents() -> Vec<Arc<dyn Agent>> {
    vec![
        Arc::new(MonitorAgent::new()),
        Arc::new(OsdAgent::new()),
        Arc::new(MdsAgent::new()),
        Arc::new(RgwAgent::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_common::keys::service;
    use std::collections::BTreeSet;

    #[test]
    fn test_leader_order() {
        let names: Vec<_> = leaders().iter().map(|l| l.name().to_string()).collect();
        assert_eq!(names, vec![service::MONITOR, service::OSD, service::FS, service::OBJECT]);
    }

    #[test]
    fn test_agent_names_unique() {
        let agents = agents();
        let names: BTreeSet<_> = agents.iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names.len(), agents.len());
    }
}
