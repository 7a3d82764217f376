//! Castle Inventory - What the fleet looks like
//!
//! Every node publishes its addresses, CRUSH location and local disks under
//! `/castle/nodes/config/<node>` and keeps a TTL heartbeat under
//! `/castle/nodes/health/<node>`. The leader loads the whole [`Inventory`]
//! at the start of each pass; agents work from their own
//! [`LocalInventory`].

pub mod disk;
pub mod heartbeat;
pub mod node;

pub use disk::{DiskType, LocalDisk, LocalInventory, Partition};
pub use heartbeat::Heartbeat;
pub use node::{Inventory, NodeConfig, UNHEALTHY_AGE};
