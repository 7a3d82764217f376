//! Local block devices

use castle_common::{Error, Result};
use castle_supervisor::{Executor, args};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Label prefix of partitions created by castle
pub const OSD_PARTITION_PREFIX: &str = "ROOK-OSD";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    #[default]
    Disk,
    Partition,
    Other(String),
}

impl DiskType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Disk => "disk",
            Self::Partition => "part",
            Self::Other(other) => other,
        }
    }
}

impl From<&str> for DiskType {
    fn from(s: &str) -> Self {
        match s {
            "disk" => Self::Disk,
            "part" => Self::Partition,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A block device on a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDisk {
    /// Kernel name, e.g. `sdb`
    pub name: String,
    pub size: u64,
    /// Partition table UUID; empty for unpartitioned disks
    pub uuid: String,
    pub filesystem: String,
    pub mountpoint: String,
    pub disk_type: DiskType,
    /// Parent device of a partition
    pub parent: String,
    pub has_children: bool,
    pub readonly: bool,
}

/// A partition of a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub size: u64,
    pub label: String,
    pub filesystem: String,
}

/// The disks of the local node, shared by the agents running there
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalInventory {
    pub disks: Vec<LocalDisk>,
}

impl LocalInventory {
    #[must_use]
    pub const fn new(disks: Vec<LocalDisk>) -> Self {
        Self { disks }
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&LocalDisk> {
        self.disks.iter().find(|d| d.name == name)
    }

    /// Disk carrying the partition table `uuid`
    #[must_use]
    pub fn by_uuid(&self, uuid: &str) -> Option<&LocalDisk> {
        if uuid.is_empty() {
            return None;
        }
        self.disks.iter().find(|d| d.uuid == uuid)
    }

    /// Record the partition table UUID written to `name`
    pub fn set_disk_uuid(&mut self, name: &str, uuid: &str) {
        if let Some(disk) = self.disks.iter_mut().find(|d| d.name == name) {
            disk.uuid = uuid.to_string();
        }
    }
}

/// Parse one line of `lsblk --pairs` output (`NAME="sda" SIZE="10"`)
pub fn parse_pairs(line: &str) -> BTreeMap<String, String> {
    let Ok(re) = Regex::new(r#"([A-Z:_-]+)="([^"]*)""#) else {
        return BTreeMap::new();
    };
    re.captures_iter(line)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

/// Parse `udevadm info --query=property` output
pub fn parse_udev_properties(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn parse_size(props: &BTreeMap<String, String>, name: &str) -> Result<u64> {
    let raw = props.get("SIZE").map_or("0", String::as_str);
    raw.parse()
        .map_err(|_| Error::invalid_input(format!("bad size '{raw}' for device {name}")))
}

/// Enumerate local block devices with `lsblk` and `udevadm`
pub async fn discover_disks(executor: &dyn Executor) -> Result<Vec<LocalDisk>> {
    let output = executor
        .execute_with_output(
            "list block devices",
            "lsblk",
            &args([
                "--bytes",
                "--pairs",
                "--output",
                "NAME,SIZE,TYPE,RO,PKNAME,FSTYPE,MOUNTPOINT",
            ]),
        )
        .await?;

    let mut disks = Vec::new();
    let rows: Vec<_> = output.lines().map(parse_pairs).filter(|p| !p.is_empty()).collect();
    for props in &rows {
        let name = props.get("NAME").cloned().unwrap_or_default();
        if name.is_empty() {
            continue;
        }
        let disk_type = DiskType::from(props.get("TYPE").map_or("", String::as_str));
        let has_children = rows
            .iter()
            .any(|p| p.get("PKNAME").is_some_and(|parent| *parent == name));
        let mut disk = LocalDisk {
            size: parse_size(props, &name)?,
            filesystem: props.get("FSTYPE").cloned().unwrap_or_default(),
            mountpoint: props.get("MOUNTPOINT").cloned().unwrap_or_default(),
            parent: props.get("PKNAME").cloned().unwrap_or_default(),
            readonly: props.get("RO").is_some_and(|ro| ro == "1"),
            disk_type,
            has_children,
            name,
            uuid: String::new(),
        };

        if disk.disk_type == DiskType::Disk {
            let udev = executor
                .execute_with_output(
                    "query device properties",
                    "udevadm",
                    &args(["info", "--query=property", format!("/dev/{}", disk.name).as_str()]),
                )
                .await?;
            let props = parse_udev_properties(&udev);
            if let Some(uuid) = props.get("ID_PART_TABLE_UUID") {
                disk.uuid.clone_from(uuid);
            }
            if disk.filesystem.is_empty()
                && let Some(fs) = props.get("ID_FS_TYPE")
            {
                disk.filesystem.clone_from(fs);
            }
        }
        disks.push(disk);
    }
    debug!("Discovered {} block devices", disks.len());
    Ok(disks)
}

/// Partitions of `device` and the space not covered by any of them
pub async fn get_device_partitions(
    executor: &dyn Executor,
    device: &str,
) -> Result<(Vec<Partition>, u64)> {
    let output = executor
        .execute_with_output(
            "list partitions",
            "lsblk",
            &args([
                format!("/dev/{device}").as_str(),
                "--bytes",
                "--pairs",
                "--output",
                "NAME,SIZE,TYPE,PKNAME,PARTLABEL,FSTYPE",
            ]),
        )
        .await?;

    let mut partitions = Vec::new();
    let mut device_size = 0;
    let mut used = 0;
    for props in output.lines().map(parse_pairs) {
        let Some(name) = props.get("NAME") else {
            continue;
        };
        if name == device {
            device_size = parse_size(&props, name)?;
        } else if props.get("PKNAME").is_some_and(|p| p == device)
            && props.get("TYPE").is_some_and(|t| t == "part")
        {
            let size = parse_size(&props, name)?;
            used += size;
            partitions.push(Partition {
                name: name.clone(),
                size,
                label: props.get("PARTLABEL").cloned().unwrap_or_default(),
                filesystem: props.get("FSTYPE").cloned().unwrap_or_default(),
            });
        }
    }
    Ok((partitions, device_size.saturating_sub(used)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_supervisor::testing::MockExecutor;

    const LSBLK: &str = r#"NAME="sda" SIZE="107374182400" TYPE="disk" RO="0" PKNAME="" FSTYPE="" MOUNTPOINT=""
NAME="sda1" SIZE="107373133824" TYPE="part" RO="0" PKNAME="sda" FSTYPE="ext4" MOUNTPOINT="/"
NAME="sdb" SIZE="10737418240" TYPE="disk" RO="0" PKNAME="" FSTYPE="" MOUNTPOINT=""
NAME="sr0" SIZE="1073741312" TYPE="rom" RO="1" PKNAME="" FSTYPE="" MOUNTPOINT=""
"#;

    #[test]
    fn test_parse_pairs() {
        let props = parse_pairs(r#"NAME="sda1" MOUNTPOINT="/mnt/my data" FSTYPE="""#);
        assert_eq!(props["NAME"], "sda1");
        assert_eq!(props["MOUNTPOINT"], "/mnt/my data");
        assert_eq!(props["FSTYPE"], "");
    }

    #[tokio::test]
    async fn test_discover_disks() {
        let exec = MockExecutor::new();
        exec.on("lsblk", LSBLK);
        exec.on("udevadm info --query=property /dev/sdb", "ID_PART_TABLE_UUID=54321\nDEVNAME=/dev/sdb\n");

        let disks = discover_disks(&exec).await.unwrap();
        assert_eq!(disks.len(), 4);
        let sda = &disks[0];
        assert!(sda.has_children);
        assert_eq!(sda.disk_type, DiskType::Disk);
        let sda1 = &disks[1];
        assert_eq!(sda1.disk_type, DiskType::Partition);
        assert_eq!(sda1.parent, "sda");
        assert_eq!(sda1.mountpoint, "/");
        let sdb = &disks[2];
        assert_eq!(sdb.uuid, "54321");
        assert!(!sdb.has_children);
        assert!(disks[3].readonly);
        assert_eq!(exec.calls_matching("udevadm").len(), 2);
    }

    #[tokio::test]
    async fn test_device_partitions() {
        let exec = MockExecutor::new();
        exec.on(
            "lsblk /dev/sdc",
            r#"NAME="sdc" SIZE="1000" TYPE="disk" PKNAME="" PARTLABEL="" FSTYPE=""
NAME="sdc1" SIZE="300" TYPE="part" PKNAME="sdc" PARTLABEL="ROOK-OSD0-WAL" FSTYPE=""
NAME="sdc2" SIZE="600" TYPE="part" PKNAME="sdc" PARTLABEL="ROOK-OSD0-DB" FSTYPE=""
"#,
        );
        let (parts, unused) = get_device_partitions(&exec, "sdc").await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].label, "ROOK-OSD0-WAL");
        assert_eq!(unused, 100);
    }

    #[test]
    fn test_local_inventory_lookup() {
        let mut inv = LocalInventory::new(vec![LocalDisk {
            name: "sdx".to_string(),
            ..LocalDisk::default()
        }]);
        assert!(inv.by_uuid("").is_none());
        inv.set_disk_uuid("sdx", "12345");
        assert_eq!(inv.by_uuid("12345").unwrap().name, "sdx");
    }
}
