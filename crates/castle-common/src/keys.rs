//! Coordination-store key layout
//!
//! All orchestration state lives under `/castle`. Services keep a
//! `desired` tree written by the leader and an `applied` tree written back
//! once a change has taken effect.

/// Root of all castle keys
pub const ROOT: &str = "/castle";
/// Root of the ceph service trees
pub const CEPH: &str = "/castle/services/ceph";
/// Agent notification root
pub const NOTIFY: &str = "/castle/_notify";
/// Node inventory root
pub const NODES_CONFIG: &str = "/castle/nodes/config";
/// Node heartbeat root
pub const NODES_HEALTH: &str = "/castle/nodes/health";
/// Leader lease key
pub const LEADER_LEASE: &str = "/castle/_leader/lease";

pub const DESIRED: &str = "desired";
pub const APPLIED: &str = "applied";
pub const SECRETS: &str = "_secrets";

/// Value agents write on success
pub const STATUS_SUCCEEDED: &str = "succeeded";
/// Value the leader writes to request work
pub const STATUS_TRIGGER: &str = "trigger";
/// Prefix of the value agents write on failure
pub const STATUS_FAILED_PREFIX: &str = "failed";

/// Service names under `/castle/services/ceph`
pub mod service {
    pub const MONITOR: &str = "monitor";
    pub const OSD: &str = "osd";
    pub const FS: &str = "fs";
    pub const MDS: &str = "mds";
    pub const OBJECT: &str = "object";
    pub const RGW: &str = "rgw";
}

#[must_use]
pub const fn state_str(applied: bool) -> &'static str {
    if applied { APPLIED } else { DESIRED }
}

/// `/castle/services/ceph/<service>/{desired,applied}`
#[must_use]
pub fn service_state(service: &str, applied: bool) -> String {
    format!("{CEPH}/{service}/{}", state_str(applied))
}

/// `/castle/services/ceph/<service>/_secrets/<name>`
#[must_use]
pub fn service_secret(service: &str, name: &str) -> String {
    format!("{CEPH}/{service}/{SECRETS}/{name}")
}

/// `/castle/services/ceph/_secrets/<name>`
#[must_use]
pub fn cluster_secret(name: &str) -> String {
    format!("{CEPH}/{SECRETS}/{name}")
}

/// `/castle/services/ceph/<name>` for cluster-wide scalars
#[must_use]
pub fn cluster_value(name: &str) -> String {
    format!("{CEPH}/{name}")
}

/// `/castle/_notify/<node>/<agent>/status`
#[must_use]
pub fn notify_status(node_id: &str, agent: &str) -> String {
    format!("{NOTIFY}/{node_id}/{agent}/status")
}

/// `/castle/nodes/config/<node>`
#[must_use]
pub fn node_config(node_id: &str) -> String {
    format!("{NODES_CONFIG}/{node_id}")
}

/// `/castle/nodes/health/<node>/heartbeat`
#[must_use]
pub fn node_heartbeat(node_id: &str) -> String {
    format!("{NODES_HEALTH}/{node_id}/heartbeat")
}

/// Monitors: `/castle/services/ceph/monitor/{desired,applied}/<node>`
#[must_use]
pub fn monitor_node(node_id: &str, applied: bool) -> String {
    format!("{}/{node_id}", service_state(service::MONITOR, applied))
}

/// OSDs: `/castle/services/ceph/osd/{desired,applied}/<node>`
#[must_use]
pub fn osd_node(node_id: &str, applied: bool) -> String {
    format!("{}/{node_id}", service_state(service::OSD, applied))
}

/// `/castle/services/ceph/osd/desired/<node>/ready`
#[must_use]
pub fn osd_ready(node_id: &str) -> String {
    format!("{}/ready", osd_node(node_id, false))
}

/// `/castle/services/ceph/osd/desired/<node>/device`
#[must_use]
pub fn osd_desired_devices(node_id: &str) -> String {
    format!("{}/device", osd_node(node_id, false))
}

/// `/castle/services/ceph/osd/desired/<node>/dir`
#[must_use]
pub fn osd_desired_dirs(node_id: &str) -> String {
    format!("{}/dir", osd_node(node_id, false))
}

/// File systems: `/castle/services/ceph/fs/{desired,applied}/<name>`
#[must_use]
pub fn filesystem(name: &str, applied: bool) -> String {
    format!("{}/{name}", service_state(service::FS, applied))
}

/// MDS placement root: `/castle/services/ceph/mds/{desired,applied}/node`
#[must_use]
pub fn mds_nodes(applied: bool) -> String {
    format!("{}/node", service_state(service::MDS, applied))
}

/// Object store flag: `/castle/services/ceph/object/{desired,applied}/state`
#[must_use]
pub fn object_state(applied: bool) -> String {
    format!("{}/state", service_state(service::OBJECT, applied))
}

/// Gateway placement root: `/castle/services/ceph/rgw/{desired,applied}/node`
#[must_use]
pub fn rgw_nodes(applied: bool) -> String {
    format!("{}/node", service_state(service::RGW, applied))
}
