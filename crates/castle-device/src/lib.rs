//! Castle Device - Storage device pipeline
//!
//! Turns the raw block devices and directories of a node into running
//! OSDs:
//!
//! 1. [`classify`] decides which disks may be touched
//! 2. [`scheme`] plans partition layouts and persists them
//! 3. [`partition`] zaps and partitions devices with `sgdisk`
//! 4. [`osd`] registers, initializes, starts and removes OSDs
//!
//! [`OsdAgent`] drives the whole pipeline from the desired state kept in
//! the coordination store ([`desired`]).

pub mod agent;
pub mod classify;
pub mod desired;
pub mod osd;
pub mod partition;
pub mod scheme;

pub use agent::{OSD_AGENT, OsdAgent};
pub use desired::{DeviceOsdEntry, DeviceOsdMapping};
pub use scheme::{MetadataDevice, PartitionDetails, PartitionRole, PartitionScheme, SchemeEntry, StoreConfig};
