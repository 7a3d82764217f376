//! Committing partition layouts to disk
//!
//! Every device is re-checked right before it is zapped: a device is only
//! rewritten when all of its partitions carry our label and it has no
//! filesystem, unless the node is configured to force formatting.

use crate::classify::check_device_available;
use crate::scheme::{MetadataDevice, PartitionScheme, SchemeEntry};
use castle_agent::AgentContext;
use castle_cluster::paths;
use castle_common::config::StoreType;
use castle_common::{Error, Result};
use castle_supervisor::{Executor, args};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const PATH_WAIT_ATTEMPTS: u32 = 25;
const PATH_WAIT_INTERVAL: Duration = Duration::from_millis(250);
const FORMAT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Destroy the partition table of `device`
pub async fn remove_partitions(executor: &dyn Executor, device: &str) -> Result<()> {
    executor
        .execute(
            &format!("zap {device}"),
            "sgdisk",
            &args(["--zap-all", format!("/dev/{device}").as_str()]),
        )
        .await?;
    Ok(())
}

/// Run `sgdisk` with arguments built by the partition scheme
pub async fn create_partitions(executor: &dyn Executor, device: &str, sgdisk_args: &[String]) -> Result<()> {
    executor
        .execute(&format!("partition {device}"), "sgdisk", sgdisk_args)
        .await?;
    Ok(())
}

/// Refuse to touch a device holding data we did not put there
pub async fn ensure_writable(executor: &dyn Executor, device: &str, force_format: bool) -> Result<()> {
    if force_format {
        return Ok(());
    }
    let (owned, filesystem) = check_device_available(executor, device).await?;
    if !filesystem.is_empty() {
        return Err(Error::precondition(format!(
            "device {device} already has a {filesystem} filesystem"
        )));
    }
    if !owned {
        return Err(Error::precondition(format!(
            "device {device} has partitions that were not created by castle"
        )));
    }
    Ok(())
}

/// Wait for a freshly created device node to show up
pub async fn wait_for_path(executor: &dyn Executor, path: &Path) -> Result<()> {
    let target = path.display().to_string();
    for attempt in 1..=PATH_WAIT_ATTEMPTS {
        if executor
            .execute(&format!("wait for {target}"), "stat", &args([target.as_str()]))
            .await
            .is_ok()
        {
            return Ok(());
        }
        if attempt < PATH_WAIT_ATTEMPTS {
            tokio::time::sleep(PATH_WAIT_INTERVAL).await;
        }
    }
    Err(Error::timeout(format!("{target} did not appear")))
}

/// Create an XFS filesystem, retrying once
pub async fn format_device(executor: &dyn Executor, path: &Path) -> Result<()> {
    let device = path.display().to_string();
    let action = format!("format {device}");
    let mkfs_args = args(["-f", device.as_str()]);
    if let Err(e) = executor.execute(&action, "mkfs.xfs", &mkfs_args).await {
        warn!("Failed to format {}, retrying: {}", device, e);
        tokio::time::sleep(FORMAT_RETRY_DELAY).await;
        executor.execute(&action, "mkfs.xfs", &mkfs_args).await?;
    }
    Ok(())
}

pub async fn mount_device(executor: &dyn Executor, path: &Path, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target)?;
    let device = path.display().to_string();
    executor
        .execute(
            &format!("mount {device}"),
            "mount",
            &args([device.as_str(), target.display().to_string().as_str()]),
        )
        .await?;
    Ok(())
}

/// Commit the WAL and DB partitions planned on the metadata device.
///
/// The first time the device is used its table is zapped; later calls only
/// add the partitions appended since the last commit.
pub async fn partition_metadata(ctx: &AgentContext, metadata: &MetadataDevice) -> Result<()> {
    let executor = ctx.executor.as_ref();
    let mut saved = PartitionScheme::load(ctx.config_dir())?;
    let existing = match &saved.metadata {
        Some(current) if current.disk_uuid == metadata.disk_uuid => current.partitions.len(),
        Some(current) => {
            return Err(Error::conflict(format!(
                "metadata device {} is already in use, cannot switch to {}",
                current.device, metadata.device
            )));
        }
        None => {
            ensure_writable(executor, &metadata.device, ctx.config.osd.force_format).await?;
            remove_partitions(executor, &metadata.device).await?;
            0
        }
    };

    if existing < metadata.partitions.len() {
        info!(
            "Creating {} metadata partitions on {}",
            metadata.partitions.len() - existing,
            metadata.device
        );
        create_partitions(executor, &metadata.device, &metadata.partition_args_from(existing)).await?;
    }

    saved.metadata = Some(metadata.clone());
    saved.save(ctx.config_dir())?;
    ctx.inventory
        .write()
        .set_disk_uuid(&metadata.device, &metadata.disk_uuid);
    Ok(())
}

/// Commit the data partitions of one OSD and record them in the scheme file
pub async fn partition_osd(ctx: &AgentContext, entry: &SchemeEntry) -> Result<()> {
    let executor = ctx.executor.as_ref();
    let data = entry.data()?;
    ensure_writable(executor, &data.device, ctx.config.osd.force_format).await?;

    info!("Partitioning {} for osd {}", data.device, entry.id);
    remove_partitions(executor, &data.device).await?;
    create_partitions(executor, &data.device, &entry.partition_args()?).await?;

    if entry.store_type == StoreType::Filestore {
        let path = data.path();
        wait_for_path(executor, &path).await?;
        format_device(executor, &path).await?;
        mount_device(executor, &path, &paths::osd_root(ctx.config_dir(), entry.id)).await?;
    }

    let mut saved = PartitionScheme::load(ctx.config_dir())?;
    saved.entries.retain(|e| e.id != entry.id);
    saved.pending.retain(|e| e.id != entry.id);
    saved.entries.push(entry.clone());
    saved.save(ctx.config_dir())?;
    ctx.inventory.write().set_disk_uuid(&data.device, &data.disk_uuid);
    Ok(())
}
