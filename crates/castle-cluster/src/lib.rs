//! Castle Cluster - The storage cluster as seen from the orchestrator
//!
//! The storage engine is reached only through the [`ClusterConnection`]
//! capability: JSON monitor commands with a required `prefix` and
//! `format: "json"`. Everything else in this crate is glue around it:
//! bootstrap identity ([`ClusterInfo`]), keyrings, INI config files and
//! the typed monitor commands the orchestrator issues.

pub mod command;
pub mod commands;
pub mod conf;
pub mod connection;
pub mod crush;
pub mod info;
pub mod keyring;
pub mod paths;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use command::MonCommand;
pub use connection::{CephCliFactory, ClusterConnection, ConnectionFactory};
pub use info::{ClusterInfo, MonitorEndpoint};

/// Short user name of the cluster administrator
pub const ADMIN_USER: &str = "admin";
/// Short user name used to register new OSDs
pub const BOOTSTRAP_OSD_USER: &str = "bootstrap-osd";
