//! Partition layouts of the OSDs on a node
//!
//! A [`PartitionScheme`] records every OSD partition committed on the node,
//! plus the dedicated metadata device when there is one. It is persisted as
//! JSON at `<configDir>/partition-scheme` and only rewritten after the
//! partitions it describes exist on disk, so the file is the source of
//! truth for what has been laid out.
//!
//! OSDs that were registered with the cluster but whose data device is not
//! partitioned yet are kept as pending, so a failed commit resumes with the
//! same OSD instead of registering another one.

use castle_common::config::{OsdConfig, StoreType};
use castle_common::{Error, Result};
use castle_inventory::disk::OSD_PARTITION_PREFIX;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const SCHEME_FILE: &str = "partition-scheme";
pub const WAL_DEFAULT_SIZE_MB: u64 = 576;
pub const DB_DEFAULT_SIZE_MB: u64 = 20480;
pub const JOURNAL_DEFAULT_SIZE_MB: u64 = 5120;
/// The first partition starts one megabyte into the device
pub const START_OFFSET_MB: u64 = 1;
pub const DISK_BY_PARTUUID: &str = "/dev/disk/by-partuuid";

const SECTORS_PER_MB: u64 = 2048;

/// What a partition holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRole {
    Wal,
    Db,
    Block,
    Data,
    Journal,
}

impl PartitionRole {
    const fn label_suffix(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Db => "DB",
            Self::Block => "BLOCK",
            Self::Data => "FS-DATA",
            Self::Journal => "FS-JOURNAL",
        }
    }
}

/// GPT name of an OSD partition, e.g. `ROOK-OSD3-WAL`
#[must_use]
pub fn partition_label(id: u32, role: PartitionRole) -> String {
    format!("{OSD_PARTITION_PREFIX}{id}-{}", role.label_suffix())
}

/// Layout parameters; zero sizes select the defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreConfig {
    pub store_type: StoreType,
    pub wal_size_mb: u64,
    pub db_size_mb: u64,
    pub journal_size_mb: u64,
}

impl StoreConfig {
    #[must_use]
    pub const fn wal_mb(&self) -> u64 {
        if self.wal_size_mb > 0 { self.wal_size_mb } else { WAL_DEFAULT_SIZE_MB }
    }

    #[must_use]
    pub const fn db_mb(&self) -> u64 {
        if self.db_size_mb > 0 { self.db_size_mb } else { DB_DEFAULT_SIZE_MB }
    }

    #[must_use]
    pub const fn journal_mb(&self) -> u64 {
        if self.journal_size_mb > 0 {
            self.journal_size_mb
        } else {
            JOURNAL_DEFAULT_SIZE_MB
        }
    }
}

impl From<&OsdConfig> for StoreConfig {
    fn from(config: &OsdConfig) -> Self {
        Self {
            store_type: config.store_type,
            wal_size_mb: config.wal_size_mb,
            db_size_mb: config.db_size_mb,
            journal_size_mb: config.journal_size_mb,
        }
    }
}

/// One partition of an OSD
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDetails {
    pub device: String,
    pub disk_uuid: String,
    pub partition_uuid: String,
    #[serde(rename = "sizeMB")]
    pub size_mb: u64,
    #[serde(rename = "offsetMB")]
    pub offset_mb: u64,
}

impl PartitionDetails {
    /// Stable device path, independent of kernel device naming
    #[must_use]
    pub fn path(&self) -> PathBuf {
        Path::new(DISK_BY_PARTUUID).join(&self.partition_uuid)
    }
}

/// All partitions of one OSD
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemeEntry {
    pub id: u32,
    pub osd_uuid: String,
    pub store_type: StoreType,
    pub partitions: BTreeMap<PartitionRole, PartitionDetails>,
}

impl SchemeEntry {
    /// True when every partition lives on the same disk
    #[must_use]
    pub fn is_collocated(&self) -> bool {
        let mut disks = self.partitions.values().map(|p| p.disk_uuid.as_str());
        disks.next().is_none_or(|first| disks.all(|d| d == first))
    }

    #[must_use]
    pub const fn data_role(&self) -> PartitionRole {
        match self.store_type {
            StoreType::Bluestore => PartitionRole::Block,
            StoreType::Filestore => PartitionRole::Data,
        }
    }

    pub fn data(&self) -> Result<&PartitionDetails> {
        self.role(self.data_role())
    }

    /// Partition holding the OSD metadata; a filestore OSD keeps it with
    /// its data
    pub fn metadata(&self) -> Result<&PartitionDetails> {
        match self.store_type {
            StoreType::Bluestore => self.role(PartitionRole::Db),
            StoreType::Filestore => self.data(),
        }
    }

    pub fn role(&self, role: PartitionRole) -> Result<&PartitionDetails> {
        self.partitions.get(&role).ok_or_else(|| {
            Error::invalid_input(format!("osd {} has no {:?} partition", self.id, role))
        })
    }

    /// `sgdisk` arguments creating this OSD's partitions on its data device.
    /// Metadata partitions on a dedicated device are created separately
    /// through [`MetadataDevice::partition_args`].
    pub fn partition_args(&self) -> Result<Vec<String>> {
        let data = self.data()?;
        let mut args = Vec::new();
        let mut number = 1;
        if self.is_collocated() && self.store_type == StoreType::Bluestore {
            for role in [PartitionRole::Wal, PartitionRole::Db] {
                let part = self.role(role)?;
                args.extend(new_partition_args(
                    number,
                    &part.partition_uuid,
                    part.offset_mb,
                    Some(part.size_mb),
                    &partition_label(self.id, role),
                ));
                number += 1;
            }
        }
        args.extend(new_partition_args(
            number,
            &data.partition_uuid,
            data.offset_mb,
            None,
            &partition_label(self.id, self.data_role()),
        ));
        args.push(format!("--disk-guid={}", data.disk_uuid));
        args.push(format!("/dev/{}", data.device));
        Ok(args)
    }
}

/// A metadata partition and the OSD it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPartition {
    pub id: u32,
    pub osd_uuid: String,
    pub role: PartitionRole,
    pub partition_uuid: String,
    #[serde(rename = "sizeMB")]
    pub size_mb: u64,
    #[serde(rename = "offsetMB")]
    pub offset_mb: u64,
}

/// A device holding the WAL and DB partitions of several OSDs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataDevice {
    pub device: String,
    pub disk_uuid: String,
    pub partitions: Vec<MetadataPartition>,
}

impl MetadataDevice {
    /// An unused metadata device with a fresh disk UUID
    #[must_use]
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            disk_uuid: Uuid::new_v4().to_string(),
            partitions: Vec::new(),
        }
    }

    /// Where the next partition goes: after the furthest existing one
    #[must_use]
    pub fn next_offset_mb(&self) -> u64 {
        self.partitions
            .iter()
            .map(|p| p.offset_mb + p.size_mb)
            .max()
            .unwrap_or(START_OFFSET_MB)
    }

    #[must_use]
    pub fn osd_ids(&self) -> BTreeSet<u32> {
        self.partitions.iter().map(|p| p.id).collect()
    }

    #[must_use]
    pub fn partition_args(&self) -> Vec<String> {
        self.partition_args_from(0)
    }

    /// `sgdisk` arguments for the partitions after the first `existing`,
    /// which are already on the device
    #[must_use]
    pub fn partition_args_from(&self, existing: usize) -> Vec<String> {
        let mut args: Vec<String> = self
            .partitions
            .iter()
            .enumerate()
            .skip(existing)
            .flat_map(|(i, p)| {
                new_partition_args(
                    i + 1,
                    &p.partition_uuid,
                    p.offset_mb,
                    Some(p.size_mb),
                    &partition_label(p.id, p.role),
                )
            })
            .collect();
        args.push(format!("--disk-guid={}", self.disk_uuid));
        args.push(format!("/dev/{}", self.device));
        args
    }
}

/// Everything laid out on a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionScheme {
    pub metadata: Option<MetadataDevice>,
    pub entries: Vec<SchemeEntry>,
    /// Registered OSDs whose data partitions are not committed yet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<SchemeEntry>,
}

impl PartitionScheme {
    #[must_use]
    pub fn path(config_dir: &Path) -> PathBuf {
        config_dir.join(SCHEME_FILE)
    }

    /// Load the committed scheme; empty when none was saved yet
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = Self::path(config_dir);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::from(e).context(format!("reading {}", path.display()))),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(config_dir)?;
        let path = Self::path(config_dir);
        std::fs::write(&path, self.to_json()?)
            .map_err(|e| Error::from(e).context(format!("writing {}", path.display())))
    }

    #[must_use]
    pub fn entry(&self, id: u32) -> Option<&SchemeEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// True if any committed partition lives on the disk
    #[must_use]
    pub fn is_disk_in_use(&self, disk_uuid: &str) -> bool {
        if disk_uuid.is_empty() {
            return false;
        }
        self.entries
            .iter()
            .flat_map(|e| e.partitions.values())
            .any(|p| p.disk_uuid == disk_uuid)
            || self
                .metadata
                .as_ref()
                .is_some_and(|m| m.disk_uuid == disk_uuid && !m.partitions.is_empty())
    }

    /// Remove and return the pending OSD planned on `device`
    pub fn take_pending(&mut self, device: &str) -> Option<SchemeEntry> {
        let pos = self
            .pending
            .iter()
            .position(|e| e.data().is_ok_and(|d| d.device == device))?;
        Some(self.pending.remove(pos))
    }

    /// Point every partition on `disk_uuid` at its current device name
    pub fn refresh_device_name(&mut self, disk_uuid: &str, name: &str) {
        for part in self.entries.iter_mut().flat_map(|e| e.partitions.values_mut()) {
            if part.disk_uuid == disk_uuid {
                part.device = name.to_string();
            }
        }
        if let Some(metadata) = &mut self.metadata
            && metadata.disk_uuid == disk_uuid
        {
            metadata.device = name.to_string();
        }
    }
}

/// Lay out an OSD on a single device.
///
/// Bluestore puts WAL, DB and block in that order from the start offset,
/// the block taking the rest. Filestore uses a single data partition.
pub fn plan_collocated(
    id: u32,
    osd_uuid: &str,
    device: &str,
    device_size_mb: u64,
    config: &StoreConfig,
) -> Result<SchemeEntry> {
    let disk_uuid = Uuid::new_v4().to_string();
    let part = |offset_mb, size_mb| PartitionDetails {
        device: device.to_string(),
        disk_uuid: disk_uuid.clone(),
        partition_uuid: Uuid::new_v4().to_string(),
        size_mb,
        offset_mb,
    };

    let mut partitions = BTreeMap::new();
    match config.store_type {
        StoreType::Filestore => {
            let size = remaining(device, device_size_mb, START_OFFSET_MB)?;
            partitions.insert(PartitionRole::Data, part(START_OFFSET_MB, size));
        }
        StoreType::Bluestore => {
            let (wal, db) = (config.wal_mb(), config.db_mb());
            let block_offset = checked_end(&[START_OFFSET_MB, wal, db])?;
            if block_offset >= device_size_mb {
                return Err(Error::invalid_input(format!(
                    "device {device} ({device_size_mb} MB) cannot hold wal ({wal} MB) and db ({db} MB)"
                )));
            }
            partitions.insert(PartitionRole::Wal, part(START_OFFSET_MB, wal));
            partitions.insert(PartitionRole::Db, part(START_OFFSET_MB + wal, db));
            partitions.insert(
                PartitionRole::Block,
                part(block_offset, device_size_mb - block_offset),
            );
        }
    }

    Ok(SchemeEntry {
        id,
        osd_uuid: osd_uuid.to_string(),
        store_type: config.store_type,
        partitions,
    })
}

/// Lay out a bluestore OSD whose block takes all of `device` while its WAL
/// and DB are appended to the shared metadata device
pub fn plan_distributed(
    id: u32,
    osd_uuid: &str,
    device: &str,
    device_size_mb: u64,
    metadata: &mut MetadataDevice,
    metadata_size_mb: u64,
    config: &StoreConfig,
) -> Result<SchemeEntry> {
    if config.store_type == StoreType::Filestore {
        return Err(Error::invalid_input(
            "filestore does not support a separate metadata device",
        ));
    }
    let (wal, db) = (config.wal_mb(), config.db_mb());
    let offset = metadata.next_offset_mb();
    if checked_end(&[offset, wal, db])? > metadata_size_mb {
        return Err(Error::invalid_input(format!(
            "metadata device {} ({metadata_size_mb} MB) has no room for wal ({wal} MB) and db ({db} MB) at offset {offset} MB",
            metadata.device
        )));
    }

    let mut partitions = BTreeMap::new();
    partitions.insert(
        PartitionRole::Block,
        PartitionDetails {
            device: device.to_string(),
            disk_uuid: Uuid::new_v4().to_string(),
            partition_uuid: Uuid::new_v4().to_string(),
            size_mb: remaining(device, device_size_mb, START_OFFSET_MB)?,
            offset_mb: START_OFFSET_MB,
        },
    );
    for (role, offset_mb, size_mb) in [
        (PartitionRole::Wal, offset, wal),
        (PartitionRole::Db, offset + wal, db),
    ] {
        let partition_uuid = Uuid::new_v4().to_string();
        metadata.partitions.push(MetadataPartition {
            id,
            osd_uuid: osd_uuid.to_string(),
            role,
            partition_uuid: partition_uuid.clone(),
            size_mb,
            offset_mb,
        });
        partitions.insert(
            role,
            PartitionDetails {
                device: metadata.device.clone(),
                disk_uuid: metadata.disk_uuid.clone(),
                partition_uuid,
                size_mb,
                offset_mb,
            },
        );
    }

    Ok(SchemeEntry {
        id,
        osd_uuid: osd_uuid.to_string(),
        store_type: StoreType::Bluestore,
        partitions,
    })
}

/// Sum of offsets and sizes, refusing sizes that do not fit in a `u64`
fn checked_end(parts: &[u64]) -> Result<u64> {
    parts
        .iter()
        .try_fold(0u64, |acc, part| acc.checked_add(*part))
        .ok_or_else(|| Error::invalid_input(format!("partition sizes {parts:?} MB overflow")))
}

fn remaining(device: &str, device_size_mb: u64, offset_mb: u64) -> Result<u64> {
    device_size_mb
        .checked_sub(offset_mb)
        .filter(|size| *size > 0)
        .ok_or_else(|| Error::invalid_input(format!("device {device} ({device_size_mb} MB) is too small")))
}

/// `sgdisk` arguments for one partition. Offsets and sizes are in MB and
/// converted to sectors; a missing size takes the largest free block.
fn new_partition_args(
    number: usize,
    guid: &str,
    offset_mb: u64,
    size_mb: Option<u64>,
    label: &str,
) -> Vec<String> {
    let new = match size_mb {
        Some(size) => format!(
            "--new={number}:{}:+{}",
            offset_mb * SECTORS_PER_MB,
            size * SECTORS_PER_MB
        ),
        None => format!("--largest-new={number}"),
    };
    vec![
        new,
        format!("--change-name={number}:{label}"),
        format!("--partition-guid={number}:{guid}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bluestore(wal: u64, db: u64) -> StoreConfig {
        StoreConfig {
            store_type: StoreType::Bluestore,
            wal_size_mb: wal,
            db_size_mb: db,
            journal_size_mb: 0,
        }
    }

    #[test]
    fn test_collocated_layout() {
        let entry = plan_collocated(3, "u-3", "sdx", 100_000, &bluestore(0, 0)).unwrap();
        let wal = entry.role(PartitionRole::Wal).unwrap();
        let db = entry.role(PartitionRole::Db).unwrap();
        let block = entry.role(PartitionRole::Block).unwrap();
        assert_eq!((wal.offset_mb, wal.size_mb), (1, 576));
        assert_eq!((db.offset_mb, db.size_mb), (577, 20480));
        assert_eq!((block.offset_mb, block.size_mb), (21057, 100_000 - 21057));
        assert!(entry.is_collocated());
        assert_ne!(wal.partition_uuid, block.partition_uuid);
    }

    #[test]
    fn test_small_device_rejected() {
        let err = plan_collocated(0, "u", "sdz", 1024, &bluestore(0, 0)).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let entry = plan_collocated(0, "u", "sdz", 1024, &bluestore(64, 64)).unwrap();
        let block = entry.data().unwrap();
        assert_eq!(block.offset_mb, 129);
        assert_eq!(block.size_mb, 1024 - 64 - 64 - 1);
    }

    #[test]
    fn test_filestore_single_partition() {
        let config = StoreConfig {
            store_type: StoreType::Filestore,
            ..StoreConfig::default()
        };
        let entry = plan_collocated(1, "u", "sdb", 2048, &config).unwrap();
        assert_eq!(entry.partitions.len(), 1);
        assert_eq!(entry.data().unwrap().size_mb, 2047);
        assert_eq!(entry.metadata().unwrap(), entry.data().unwrap());
        assert_eq!(
            entry.partition_args().unwrap()[1],
            "--change-name=1:ROOK-OSD1-FS-DATA"
        );
    }

    #[test]
    fn test_distributed_appends_to_metadata_device() {
        let mut metadata = MetadataDevice::new("nvme0n1");
        let config = bluestore(0, 0);
        let first = plan_distributed(1, "u1", "sdb", 50_000, &mut metadata, 100_000, &config).unwrap();
        let second = plan_distributed(2, "u2", "sdc", 50_000, &mut metadata, 100_000, &config).unwrap();

        assert!(!first.is_collocated());
        assert_eq!(first.data().unwrap().offset_mb, 1);
        assert_eq!(first.data().unwrap().size_mb, 49_999);
        assert_eq!(first.role(PartitionRole::Wal).unwrap().offset_mb, 1);
        assert_eq!(second.role(PartitionRole::Wal).unwrap().offset_mb, 1 + 576 + 20480);
        assert_eq!(
            first.role(PartitionRole::Db).unwrap().disk_uuid,
            second.role(PartitionRole::Db).unwrap().disk_uuid
        );
        assert_eq!(metadata.partitions.len(), 4);
        assert_eq!(metadata.osd_ids(), BTreeSet::from([1, 2]));

        let err = plan_distributed(3, "u3", "sdd", 50_000, &mut metadata, 50_000, &config).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_partition_args() {
        let entry = plan_collocated(3, "u", "sdx", 100_000, &bluestore(0, 0)).unwrap();
        let args = entry.partition_args().unwrap();
        let wal = entry.role(PartitionRole::Wal).unwrap();
        assert_eq!(args[0], "--new=1:2048:+1179648");
        assert_eq!(args[1], "--change-name=1:ROOK-OSD3-WAL");
        assert_eq!(args[2], format!("--partition-guid=1:{}", wal.partition_uuid));
        assert_eq!(args[3], "--new=2:1181696:+41943040");
        assert_eq!(args[6], "--largest-new=3");
        assert_eq!(args[7], "--change-name=3:ROOK-OSD3-BLOCK");
        assert_eq!(args[9], format!("--disk-guid={}", wal.disk_uuid));
        assert_eq!(args[10], "/dev/sdx");

        let mut metadata = MetadataDevice::new("nvme0n1");
        let entry = plan_distributed(4, "u", "sdb", 50_000, &mut metadata, 100_000, &bluestore(0, 0)).unwrap();
        assert_eq!(entry.partition_args().unwrap()[0], "--largest-new=1");
        let meta_args = metadata.partition_args();
        assert_eq!(meta_args[1], "--change-name=1:ROOK-OSD4-WAL");
        assert_eq!(meta_args[4], "--change-name=2:ROOK-OSD4-DB");
        assert_eq!(meta_args.last().unwrap(), "/dev/nvme0n1");

        plan_distributed(5, "u", "sdc", 50_000, &mut metadata, 100_000, &bluestore(0, 0)).unwrap();
        let added = metadata.partition_args_from(2);
        assert_eq!(added[0], "--new=3:43124736:+1179648");
        assert_eq!(added[1], "--change-name=3:ROOK-OSD5-WAL");
        assert_eq!(added.len(), 8);
    }

    #[test]
    fn test_save_load_save_identical() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = MetadataDevice::new("nvme0n1");
        let config = bluestore(0, 0);
        let scheme = PartitionScheme {
            entries: vec![
                plan_distributed(1, "u1", "sdb", 50_000, &mut metadata, 100_000, &config).unwrap(),
                plan_collocated(2, "u2", "sdc", 50_000, &config).unwrap(),
            ],
            metadata: Some(metadata),
            pending: Vec::new(),
        };
        scheme.save(dir.path()).unwrap();
        let first = std::fs::read(PartitionScheme::path(dir.path())).unwrap();

        let loaded = PartitionScheme::load(dir.path()).unwrap();
        assert_eq!(loaded, scheme);
        loaded.save(dir.path()).unwrap();
        let second = std::fs::read(PartitionScheme::path(dir.path())).unwrap();
        assert_eq!(first, second);

        let json: serde_json::Value = serde_json::from_slice(&first).unwrap();
        assert!(json["entries"][0]["partitions"]["wal"]["sizeMB"].is_u64());
        assert_eq!(json["entries"][1]["storeType"], "bluestore");
        assert!(json["metadata"]["diskUuid"].is_string());
    }

    #[test]
    fn test_oversized_wal_and_db_rejected() {
        let config = bluestore(u64::MAX, 1);
        let err = plan_collocated(0, "u", "sdz", 100_000, &config).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let mut metadata = MetadataDevice::new("nvme0n1");
        let err = plan_distributed(1, "u", "sdb", 50_000, &mut metadata, 100_000, &config).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(metadata.partitions.is_empty());
    }

    #[test]
    fn test_pending_entry_taken_by_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheme = PartitionScheme::default();
        scheme.pending.push(plan_collocated(7, "u7", "sdd", 50_000, &bluestore(0, 0)).unwrap());
        scheme.save(dir.path()).unwrap();

        let mut loaded = PartitionScheme::load(dir.path()).unwrap();
        assert!(loaded.take_pending("sdc").is_none());
        assert_eq!(loaded.take_pending("sdd").unwrap().id, 7);
        assert!(loaded.pending.is_empty());
        assert!(!loaded.to_json().unwrap().contains("pending"));
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PartitionScheme::load(dir.path()).unwrap(), PartitionScheme::default());
    }

    #[test]
    fn test_refresh_device_name() {
        let mut scheme = PartitionScheme {
            metadata: None,
            entries: vec![plan_collocated(2, "u2", "sdc", 50_000, &bluestore(0, 0)).unwrap()],
            pending: Vec::new(),
        };
        let disk = scheme.entries[0].data().unwrap().disk_uuid.clone();
        assert!(scheme.is_disk_in_use(&disk));
        assert!(!scheme.is_disk_in_use(""));
        scheme.refresh_device_name(&disk, "sdq");
        assert!(scheme.entries[0].partitions.values().all(|p| p.device == "sdq"));
    }
}
