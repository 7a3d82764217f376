//! Which local disks may host OSDs

use castle_common::Result;
use castle_inventory::disk::{DiskType, LocalDisk, OSD_PARTITION_PREFIX, Partition, parse_pairs};
use castle_supervisor::{Executor, args};

/// True if every partition carries our label prefix
#[must_use]
pub fn owns_partitions(partitions: &[Partition]) -> bool {
    partitions
        .iter()
        .all(|p| p.label.starts_with(OSD_PARTITION_PREFIX))
}

/// A whole, writable disk without a filesystem whose partitions, if any,
/// are all ours
#[must_use]
pub fn is_eligible(disk: &LocalDisk, partitions: &[Partition]) -> bool {
    disk.disk_type == DiskType::Disk
        && !disk.readonly
        && disk.filesystem.is_empty()
        && owns_partitions(partitions)
}

/// Filesystem signature on the device itself, empty if none
pub async fn device_filesystem(executor: &dyn Executor, device: &str) -> Result<String> {
    let output = executor
        .execute_with_output(
            &format!("read filesystem of {device}"),
            "lsblk",
            &args([
                format!("/dev/{device}").as_str(),
                "--bytes",
                "--nodeps",
                "--pairs",
                "--output",
                "FSTYPE",
            ]),
        )
        .await?;
    Ok(output
        .lines()
        .map(parse_pairs)
        .find_map(|props| props.get("FSTYPE").cloned())
        .unwrap_or_default())
}

/// Re-read the device: whether all its partitions are ours, and any
/// filesystem found on it
pub async fn check_device_available(
    executor: &dyn Executor,
    device: &str,
) -> Result<(bool, String)> {
    let (partitions, _) = castle_inventory::disk::get_device_partitions(executor, device).await?;
    let filesystem = device_filesystem(executor, device).await?;
    Ok((owns_partitions(&partitions), filesystem))
}

/// Names of the inventory disks that may host an OSD
pub async fn eligible_disks(executor: &dyn Executor, disks: &[LocalDisk]) -> Result<Vec<String>> {
    let mut eligible = Vec::new();
    for disk in disks.iter().filter(|d| d.disk_type == DiskType::Disk) {
        let (partitions, _) =
            castle_inventory::disk::get_device_partitions(executor, &disk.name).await?;
        if is_eligible(disk, &partitions) {
            eligible.push(disk.name.clone());
        }
    }
    Ok(eligible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_supervisor::testing::MockExecutor;

    fn disk(name: &str) -> LocalDisk {
        LocalDisk {
            name: name.to_string(),
            size: 10 << 30,
            disk_type: DiskType::Disk,
            ..LocalDisk::default()
        }
    }

    fn partition(label: &str) -> Partition {
        Partition {
            name: "sdb1".to_string(),
            size: 1 << 20,
            label: label.to_string(),
            filesystem: String::new(),
        }
    }

    #[test]
    fn test_eligibility() {
        assert!(is_eligible(&disk("sdb"), &[]));
        assert!(is_eligible(&disk("sdb"), &[partition("ROOK-OSD0-WAL"), partition("ROOK-OSD0-DB")]));
        assert!(!is_eligible(&disk("sdb"), &[partition("ROOK-OSD0-WAL"), partition("EFI")]));

        let mut with_fs = disk("sdb");
        with_fs.filesystem = "ext4".to_string();
        assert!(!is_eligible(&with_fs, &[]));

        let mut readonly = disk("sr0");
        readonly.readonly = true;
        assert!(!is_eligible(&readonly, &[]));

        let mut part = disk("sda1");
        part.disk_type = DiskType::Partition;
        assert!(!is_eligible(&part, &[]));
    }

    #[tokio::test]
    async fn test_check_device_available() {
        let exec = MockExecutor::new();
        exec.on(
            "lsblk /dev/sdb --bytes --pairs",
            "NAME=\"sdb\" SIZE=\"1000\" TYPE=\"disk\" PKNAME=\"\" PARTLABEL=\"\" FSTYPE=\"\"\n\
             NAME=\"sdb1\" SIZE=\"500\" TYPE=\"part\" PKNAME=\"sdb\" PARTLABEL=\"data\" FSTYPE=\"xfs\"\n",
        );
        exec.on("lsblk /dev/sdb --bytes --nodeps", "FSTYPE=\"\"\n");

        let (owned, fs) = check_device_available(&exec, "sdb").await.unwrap();
        assert!(!owned);
        assert!(fs.is_empty());

        exec.on("lsblk /dev/sdc --bytes --pairs", "NAME=\"sdc\" SIZE=\"1000\" TYPE=\"disk\"\n");
        exec.on("lsblk /dev/sdc --bytes --nodeps", "FSTYPE=\"ext4\"\n");
        let (owned, fs) = check_device_available(&exec, "sdc").await.unwrap();
        assert!(owned);
        assert_eq!(fs, "ext4");
    }

    #[tokio::test]
    async fn test_eligible_disks() {
        let exec = MockExecutor::new();
        exec.on(
            "lsblk /dev/sda",
            "NAME=\"sda\" SIZE=\"1000\" TYPE=\"disk\" PKNAME=\"\"\n\
             NAME=\"sda1\" SIZE=\"1000\" TYPE=\"part\" PKNAME=\"sda\" PARTLABEL=\"root\"\n",
        );
        exec.on("lsblk /dev/sdb", "NAME=\"sdb\" SIZE=\"1000\" TYPE=\"disk\" PKNAME=\"\"\n");

        let eligible = eligible_disks(&exec, &[disk("sda"), disk("sdb")]).await.unwrap();
        assert_eq!(eligible, vec!["sdb".to_string()]);
    }
}
