//! Desired OSD state of a node
//!
//! Devices are keyed by the UUID of their partition table, since kernel
//! names can change across reboots:
//!
//! ```text
//! osd/desired/<node>/device/<diskUUID>/osd-id-data      = 3
//! osd/desired/<node>/device/<diskUUID>/osd-id-metadata  = 3,4
//! osd/desired/<node>/dir/<pseudodir>/{path,osd-id-data}
//! ```

use castle_common::config::OsdConfig;
use castle_common::{Result, keys};
use castle_inventory::LocalInventory;
use castle_kv::util::{delete_if_exists, get_tree_optional};
use castle_kv::{KvNode, KvStore, path};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub const OSD_ID_DATA: &str = "osd-id-data";
pub const OSD_ID_METADATA: &str = "osd-id-metadata";
pub const DIR_PATH: &str = "path";

/// OSDs a device holds data or metadata for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceOsdEntry {
    pub data: Option<u32>,
    /// `Some` for devices holding OSD metadata; an empty list marks a
    /// metadata device with no partitions yet
    pub metadata: Option<Vec<u32>>,
}

impl DeviceOsdEntry {
    /// A new device, or a collocated device whose partitions are gone
    #[must_use]
    pub fn is_desired_for_data(&self) -> bool {
        match (self.data, &self.metadata) {
            (None, None) => true,
            (Some(_), Some(ids)) => ids.len() == 1,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_desired_for_metadata(&self) -> bool {
        self.data.is_none() && self.metadata.as_ref().is_some_and(Vec::is_empty)
    }
}

/// Desired devices of a node by current device name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceOsdMapping {
    pub entries: BTreeMap<String, DeviceOsdEntry>,
}

impl DeviceOsdMapping {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Leading `/` stripped and the remaining `/` replaced by `_`
#[must_use]
pub fn pseudo_dir(dir: &str) -> String {
    dir.trim_start_matches('/').replace('/', "_")
}

fn parse_id(node: &KvNode, key: &str) -> Option<u32> {
    let raw = node.child_value(key)?;
    match raw.trim().parse() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!("Failed to parse osd id '{}' under {}", raw, node.key);
            None
        }
    }
}

fn parse_id_list(raw: &str, key: &str) -> Vec<u32> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Failed to parse osd id '{}' under {}", s, key);
                None
            }
        })
        .collect()
}

/// Desired devices from configuration and the store.
///
/// Configured devices start out unassigned and the configured metadata
/// device as an empty metadata holder. Store entries are resolved to names
/// through the local inventory and override the configured state.
pub async fn load_desired_devices(
    store: &dyn KvStore,
    node_id: &str,
    inventory: &LocalInventory,
    config: &OsdConfig,
) -> Result<DeviceOsdMapping> {
    let mut mapping = DeviceOsdMapping::default();
    for name in &config.devices {
        mapping.entries.entry(name.clone()).or_default();
    }
    if let Some(metadata) = &config.metadata_device {
        mapping.entries.entry(metadata.clone()).or_insert(DeviceOsdEntry {
            data: None,
            metadata: Some(Vec::new()),
        });
    }

    let Some(tree) = get_tree_optional(store, &keys::osd_desired_devices(node_id)).await? else {
        return Ok(mapping);
    };
    for device in &tree.children {
        let disk_uuid = device.name();
        let entry = DeviceOsdEntry {
            data: parse_id(device, OSD_ID_DATA),
            metadata: device
                .child_value(OSD_ID_METADATA)
                .map(|raw| parse_id_list(raw, &device.key)),
        };
        match inventory.by_uuid(disk_uuid) {
            Some(disk) => {
                mapping.entries.insert(disk.name.clone(), entry);
            }
            None => warn!("Failed to find a local disk with uuid {}", disk_uuid),
        }
    }
    debug!("Desired devices on {}: {:?}", node_id, mapping.entries);
    Ok(mapping)
}

/// Desired directories and the OSD already assigned to each
pub async fn load_desired_dirs(store: &dyn KvStore, node_id: &str) -> Result<BTreeMap<String, Option<u32>>> {
    let mut dirs = BTreeMap::new();
    let Some(tree) = get_tree_optional(store, &keys::osd_desired_dirs(node_id)).await? else {
        return Ok(dirs);
    };
    for dir in &tree.children {
        if let Some(dir_path) = dir.child_value(DIR_PATH)
            && !dir_path.is_empty()
        {
            dirs.insert(dir_path.to_string(), parse_id(dir, OSD_ID_DATA));
        }
    }
    Ok(dirs)
}

/// Every OSD id recorded against a desired device or directory
pub async fn desired_osd_ids(store: &dyn KvStore, node_id: &str) -> Result<BTreeSet<u32>> {
    let mut ids = BTreeSet::new();
    for key in [keys::osd_desired_devices(node_id), keys::osd_desired_dirs(node_id)] {
        if let Some(tree) = get_tree_optional(store, &key).await? {
            ids.extend(tree.children.iter().filter_map(|c| parse_id(c, OSD_ID_DATA)));
        }
    }
    Ok(ids)
}

/// Record the OSD whose data lives on a device
pub async fn associate_data(store: &dyn KvStore, node_id: &str, disk_uuid: &str, id: u32) -> Result<()> {
    let key = path::join(&keys::osd_desired_devices(node_id), disk_uuid);
    store
        .set(&path::join(&key, OSD_ID_DATA), &id.to_string(), None)
        .await?;
    Ok(())
}

/// Record the OSD whose data lives in a directory
pub async fn associate_dir(store: &dyn KvStore, node_id: &str, dir: &str, id: u32) -> Result<()> {
    let key = path::join(&keys::osd_desired_dirs(node_id), &pseudo_dir(dir));
    store
        .set(&path::join(&key, OSD_ID_DATA), &id.to_string(), None)
        .await?;
    Ok(())
}

/// Record the OSDs whose metadata lives on a device
pub async fn associate_metadata(
    store: &dyn KvStore,
    node_id: &str,
    disk_uuid: &str,
    ids: impl IntoIterator<Item = u32>,
) -> Result<()> {
    let list = ids
        .into_iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let key = path::join(&keys::osd_desired_devices(node_id), disk_uuid);
    store.set(&path::join(&key, OSD_ID_METADATA), &list, None).await?;
    Ok(())
}

/// Ask for an OSD on the device with partition table `disk_uuid`
pub async fn add_desired_device(store: &dyn KvStore, node_id: &str, disk_uuid: &str) -> Result<()> {
    store
        .create_dir(&path::join(&keys::osd_desired_devices(node_id), disk_uuid))
        .await?;
    Ok(())
}

pub async fn remove_desired_device(store: &dyn KvStore, node_id: &str, disk_uuid: &str) -> Result<()> {
    delete_if_exists(store, &path::join(&keys::osd_desired_devices(node_id), disk_uuid)).await?;
    Ok(())
}

/// Ask for an OSD backed by the directory `dir`
pub async fn add_desired_dir(store: &dyn KvStore, node_id: &str, dir: &str) -> Result<()> {
    let key = path::join(&keys::osd_desired_dirs(node_id), &pseudo_dir(dir));
    store.set(&path::join(&key, DIR_PATH), dir, None).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_inventory::LocalDisk;
    use castle_kv::MemoryStore;

    fn inventory() -> LocalInventory {
        LocalInventory::new(vec![
            LocalDisk {
                name: "sda".to_string(),
                uuid: "uuid-a".to_string(),
                ..LocalDisk::default()
            },
            LocalDisk {
                name: "sdb".to_string(),
                uuid: "uuid-b".to_string(),
                ..LocalDisk::default()
            },
        ])
    }

    #[test]
    fn test_pseudo_dir() {
        assert_eq!(pseudo_dir("/var/lib/castle"), "var_lib_castle");
        assert_eq!(pseudo_dir("data"), "data");
    }

    #[test]
    fn test_desired_roles() {
        let new = DeviceOsdEntry::default();
        assert!(new.is_desired_for_data());
        assert!(!new.is_desired_for_metadata());

        let metadata = DeviceOsdEntry {
            data: None,
            metadata: Some(vec![]),
        };
        assert!(metadata.is_desired_for_metadata());
        assert!(!metadata.is_desired_for_data());

        let collocated = DeviceOsdEntry {
            data: Some(3),
            metadata: Some(vec![3]),
        };
        assert!(collocated.is_desired_for_data());

        let distributed = DeviceOsdEntry {
            data: Some(4),
            metadata: None,
        };
        assert!(!distributed.is_desired_for_data());
        assert!(!distributed.is_desired_for_metadata());
    }

    #[tokio::test]
    async fn test_load_desired_devices() {
        let store = MemoryStore::new();
        associate_data(&store, "n1", "uuid-a", 3).await.unwrap();
        associate_metadata(&store, "n1", "uuid-a", [3]).await.unwrap();
        associate_metadata(&store, "n1", "uuid-b", [4, 5]).await.unwrap();
        add_desired_device(&store, "n1", "uuid-gone").await.unwrap();

        let config = OsdConfig {
            devices: vec!["sdc".to_string(), "sda".to_string()],
            metadata_device: Some("nvme0n1".to_string()),
            ..OsdConfig::default()
        };
        let mapping = load_desired_devices(&store, "n1", &inventory(), &config).await.unwrap();

        assert_eq!(mapping.entries.len(), 4);
        assert_eq!(mapping.entries["sda"], DeviceOsdEntry { data: Some(3), metadata: Some(vec![3]) });
        assert_eq!(mapping.entries["sdb"], DeviceOsdEntry { data: None, metadata: Some(vec![4, 5]) });
        assert_eq!(mapping.entries["sdc"], DeviceOsdEntry::default());
        assert!(mapping.entries["nvme0n1"].is_desired_for_metadata());
    }

    #[tokio::test]
    async fn test_dirs_and_ids() {
        let store = MemoryStore::new();
        add_desired_dir(&store, "n1", "/mnt/osd").await.unwrap();
        add_desired_dir(&store, "n1", "/var/lib/castle").await.unwrap();
        associate_dir(&store, "n1", "/var/lib/castle", 7).await.unwrap();
        associate_data(&store, "n1", "uuid-a", 2).await.unwrap();

        let dirs = load_desired_dirs(&store, "n1").await.unwrap();
        assert_eq!(dirs["/mnt/osd"], None);
        assert_eq!(dirs["/var/lib/castle"], Some(7));

        let ids = desired_osd_ids(&store, "n1").await.unwrap();
        assert_eq!(ids, BTreeSet::from([2, 7]));

        remove_desired_device(&store, "n1", "uuid-a").await.unwrap();
        remove_desired_device(&store, "n1", "uuid-a").await.unwrap();
        assert_eq!(desired_osd_ids(&store, "n1").await.unwrap(), BTreeSet::from([7]));
    }
}
