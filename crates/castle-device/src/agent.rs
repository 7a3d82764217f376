//! The OSD agent
//!
//! Directory OSDs are configured while the leader waits. Device OSDs are
//! configured by a background task: the agent reports success once the
//! work is accepted, and each OSD appears in the applied tree as it
//! completes. Overlapping requests are coalesced into another round of the
//! running task.

use crate::classify::is_eligible;
use crate::desired::{
    DeviceOsdMapping, add_desired_dir, associate_dir, associate_metadata, desired_osd_ids,
    load_desired_devices, load_desired_dirs,
};
use crate::osd::{OsdInstance, applied_osds, register_osd, remove_osd, start_osd};
use crate::partition::partition_metadata;
use crate::scheme::{
    MetadataDevice, PartitionScheme, SchemeEntry, StoreConfig, plan_collocated, plan_distributed,
};
use async_trait::async_trait;
use castle_agent::{Agent, AgentContext, ConfigGuard};
use castle_cluster::connection::connect_as_admin;
use castle_cluster::keyring::{bootstrap_osd_keyring, create_keyring};
use castle_cluster::{BOOTSTRAP_OSD_USER, ClusterConnection, ClusterInfo, paths};
use castle_common::{Error, Result, keys};
use castle_inventory::LocalInventory;
use castle_inventory::disk::get_device_partitions;
use castle_kv::util::get_optional;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const OSD_AGENT: &str = "osd";

const BOOTSTRAP_OSD_CAPS: &[&str] = &["mon", "allow profile bootstrap-osd"];
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Runs the OSDs of a node
#[derive(Default)]
pub struct OsdAgent {
    guard: ConfigGuard,
    devices_task: Mutex<Option<JoinHandle<()>>>,
}

impl OsdAgent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the device configuration started by the last reconcile
    pub async fn wait_for_devices(&self) {
        let task = self.devices_task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!("Device configuration task failed: {}", e);
        }
    }
}

#[async_trait]
impl Agent for OsdAgent {
    fn name(&self) -> &str {
        OSD_AGENT
    }

    /// Desire the configured directories; with nothing configured at all,
    /// the config dir itself backs an OSD
    async fn initialize(&self, ctx: &AgentContext) -> Result<()> {
        let osd = &ctx.config.osd;
        let mut dirs = osd.directories.clone();
        if dirs.is_empty() && osd.devices.is_empty() && osd.metadata_device.is_none() {
            dirs.push(ctx.config_dir().to_path_buf());
        }
        for dir in &dirs {
            add_desired_dir(ctx.store.as_ref(), &ctx.node_id, &dir.display().to_string()).await?;
        }
        Ok(())
    }

    async fn reconcile_local(&self, ctx: &AgentContext) -> Result<()> {
        let ready = get_optional(ctx.store.as_ref(), &keys::osd_ready(&ctx.node_id)).await?;
        if ready.as_deref() != Some("1") {
            info!("Osds on node {} are not ready to be configured", ctx.node_id);
            return Ok(());
        }
        let info = ctx
            .cluster_info()
            .await?
            .ok_or_else(|| Error::unavailable("cluster info has not been bootstrapped"))?;
        let store_config = StoreConfig::from(&ctx.config.osd);

        let conn = connect_as_admin(ctx.factory.as_ref(), &info).await?;
        let result = async {
            create_keyring(
                conn.as_ref(),
                &format!("client.{BOOTSTRAP_OSD_USER}"),
                BOOTSTRAP_OSD_CAPS,
                &paths::bootstrap_osd_keyring(ctx.config_dir(), &info.name),
                bootstrap_osd_keyring,
            )
            .await?;
            configure_dirs(ctx, &info, conn.as_ref(), &store_config).await
        }
        .await;
        conn.shutdown().await;

        if let Some(hold) = self.guard.try_start() {
            let ctx = ctx.clone();
            let info = info.clone();
            let task = tokio::spawn(async move {
                let mut hold = hold;
                loop {
                    if let Err(e) = configure_devices(&ctx, &info, &store_config).await {
                        error!("Failed to configure osd devices on {}: {}", ctx.node_id, e);
                    }
                    if let Err(e) = remove_undesired(&ctx, &info).await {
                        error!("Failed to remove undesired osds on {}: {}", ctx.node_id, e);
                    }
                    match hold.finish() {
                        Some(next) => hold = next,
                        None => break,
                    }
                    debug!("Repeating osd device configuration on {}", ctx.node_id);
                }
            });
            *self.devices_task.lock() = Some(task);
        } else {
            debug!("Osd device configuration already running on {}", ctx.node_id);
        }
        result
    }

    async fn destroy_local(&self, ctx: &AgentContext) -> Result<()> {
        for id in applied_osds(ctx.store.as_ref(), &ctx.node_id).await?.keys() {
            info!("Stopping osd {}", id);
            if let Err(e) = ctx.supervisor.stop(&format!("osd{id}")).await {
                warn!("Failed to stop osd {}: {}", id, e);
            }
        }
        Ok(())
    }
}

async fn register(ctx: &AgentContext, info: &ClusterInfo) -> Result<(u32, String)> {
    let conn = ctx.factory.connect(info, BOOTSTRAP_OSD_USER).await?;
    let result = register_osd(conn.as_ref()).await;
    conn.shutdown().await;
    result
}

/// Register, initialize and start an OSD in every desired directory
async fn configure_dirs(
    ctx: &AgentContext,
    info: &ClusterInfo,
    conn: &dyn ClusterConnection,
    store: &StoreConfig,
) -> Result<()> {
    let dirs = load_desired_dirs(ctx.store.as_ref(), &ctx.node_id).await?;
    if dirs.is_empty() {
        return Ok(());
    }

    let mut succeeded = 0;
    let mut last_err = None;
    for (dir, id) in &dirs {
        match configure_dir(ctx, info, conn, store, dir, *id).await {
            Ok(()) => succeeded += 1,
            Err(e) => {
                error!("Failed to configure osd in dir {}: {}", dir, e);
                last_err = Some(e);
            }
        }
    }
    info!("{}/{} osd dirs succeeded on node {}", succeeded, dirs.len(), ctx.node_id);
    last_err.map_or(Ok(()), Err)
}

async fn configure_dir(
    ctx: &AgentContext,
    info: &ClusterInfo,
    conn: &dyn ClusterConnection,
    store: &StoreConfig,
    dir: &str,
    id: Option<u32>,
) -> Result<()> {
    let existing = id
        .map(|id| OsdInstance::for_dir(id, String::new(), dir))
        .filter(|osd| !osd.is_new());
    let mut osd = match existing {
        Some(osd) => osd,
        None => {
            if let Some(id) = id {
                warn!("Osd {} in {} was never initialized, registering a new one", id, dir);
            }
            let (id, uuid) = register(ctx, info).await?;
            associate_dir(ctx.store.as_ref(), &ctx.node_id, dir, id).await?;
            OsdInstance::for_dir(id, uuid, dir)
        }
    };
    start_osd(ctx, info, conn, &mut osd, store).await
}

/// Megabytes of a local disk
fn disk_size_mb(inventory: &LocalInventory, name: &str) -> Result<u64> {
    inventory
        .by_name(name)
        .map(|d| d.size / BYTES_PER_MB)
        .ok_or_else(|| Error::not_found(format!("device {name} is not on this node")))
}

/// Refuse devices that cannot host an OSD
async fn check_eligible(ctx: &AgentContext, inventory: &LocalInventory, name: &str) -> Result<()> {
    let disk = inventory
        .by_name(name)
        .ok_or_else(|| Error::not_found(format!("device {name} is not on this node")))?;
    if ctx.config.osd.force_format && !disk.readonly {
        return Ok(());
    }
    let (partitions, _) = get_device_partitions(ctx.executor.as_ref(), name).await?;
    if is_eligible(disk, &partitions) {
        Ok(())
    } else {
        Err(Error::precondition(format!("device {name} is not eligible to host an osd")))
    }
}

/// Plan one new data device, registering its OSD only once the layout fits.
///
/// A device with a pending OSD from an earlier attempt gets that OSD back.
/// Its layout is kept when its metadata partitions are already committed,
/// otherwise it is planned again under the same id.
async fn plan_data_device(
    ctx: &AgentContext,
    info: &ClusterInfo,
    inventory: &LocalInventory,
    scheme: &mut PartitionScheme,
    name: &str,
    store: &StoreConfig,
) -> Result<SchemeEntry> {
    check_eligible(ctx, inventory, name).await?;
    let size_mb = disk_size_mb(inventory, name)?;
    let metadata_size_mb = match &scheme.metadata {
        Some(metadata) => Some(disk_size_mb(inventory, &metadata.device)?),
        None => None,
    };
    let plan = |id: u32, uuid: &str, metadata: Option<&mut MetadataDevice>| {
        match (metadata, metadata_size_mb) {
            (Some(metadata), Some(metadata_mb)) => {
                plan_distributed(id, uuid, name, size_mb, metadata, metadata_mb, store)
            }
            _ => plan_collocated(id, uuid, name, size_mb, store),
        }
    };

    if let Some(pending) = scheme.take_pending(name) {
        let committed = scheme
            .metadata
            .as_ref()
            .is_some_and(|m| m.osd_ids().contains(&pending.id));
        if committed || (pending.is_collocated() && scheme.metadata.is_none()) {
            info!("Resuming osd {} on device {}", pending.id, name);
            return Ok(pending);
        }
        info!("Planning pending osd {} on device {} again", pending.id, name);
        return match plan(pending.id, &pending.osd_uuid, scheme.metadata.as_mut()) {
            Ok(entry) => Ok(entry),
            Err(e) => {
                scheme.pending.push(pending);
                Err(e)
            }
        };
    }

    let mut trial = scheme.metadata.clone();
    plan(0, "", trial.as_mut())?;

    let (id, uuid) = register(ctx, info).await?;
    plan(id, &uuid, scheme.metadata.as_mut())
}

/// Work out the layout of every desired device. Devices already holding
/// committed partitions keep them; new data devices get an OSD id.
async fn plan_devices(
    ctx: &AgentContext,
    info: &ClusterInfo,
    mapping: &DeviceOsdMapping,
    inventory: &LocalInventory,
    store: &StoreConfig,
) -> Result<(PartitionScheme, usize)> {
    let mut scheme = PartitionScheme::load(ctx.config_dir())?;
    let mut data_devices = Vec::new();
    for (name, entry) in &mapping.entries {
        let disk_uuid = inventory.by_name(name).map(|d| d.uuid.as_str()).unwrap_or_default();
        if scheme.is_disk_in_use(disk_uuid) {
            scheme.refresh_device_name(disk_uuid, name);
        } else if entry.is_desired_for_data() {
            data_devices.push(name.as_str());
        } else if entry.is_desired_for_metadata() {
            match &scheme.metadata {
                Some(current) if !disk_uuid.is_empty() && current.disk_uuid == disk_uuid => {}
                Some(current) => {
                    return Err(Error::conflict(format!(
                        "{name} is desired for metadata, but {} ({}) is already the metadata device",
                        current.device, current.disk_uuid
                    )));
                }
                None => {
                    check_eligible(ctx, inventory, name).await?;
                    scheme.metadata = Some(MetadataDevice::new(name.as_str()));
                }
            }
        }
    }

    let mut failed = 0;
    for name in data_devices {
        match plan_data_device(ctx, info, inventory, &mut scheme, name, store).await {
            Ok(entry) => {
                scheme.pending.push(entry.clone());
                scheme.entries.push(entry);
            }
            Err(e) => {
                error!("Failed to plan osd on device {}: {}", name, e);
                failed += 1;
            }
        }
    }
    Ok((scheme, failed))
}

/// Persist the registered but uncommitted OSDs before touching any disk
fn save_pending(ctx: &AgentContext, scheme: &PartitionScheme) -> Result<()> {
    let mut saved = PartitionScheme::load(ctx.config_dir())?;
    if saved.pending != scheme.pending {
        saved.pending.clone_from(&scheme.pending);
        saved.save(ctx.config_dir())?;
    }
    Ok(())
}

/// Partition, initialize and start the OSDs of every desired device
async fn configure_devices(ctx: &AgentContext, info: &ClusterInfo, store: &StoreConfig) -> Result<()> {
    let inventory = ctx.inventory.read().clone();
    let mapping =
        load_desired_devices(ctx.store.as_ref(), &ctx.node_id, &inventory, &ctx.config.osd).await?;
    if mapping.is_empty() {
        return Ok(());
    }

    let (scheme, mut failed) = plan_devices(ctx, info, &mapping, &inventory, store).await?;
    debug!("Partition scheme on {}: {:?}", ctx.node_id, scheme);
    save_pending(ctx, &scheme)?;

    if let Some(metadata) = &scheme.metadata
        && !metadata.partitions.is_empty()
    {
        partition_metadata(ctx, metadata).await?;
        associate_metadata(ctx.store.as_ref(), &ctx.node_id, &metadata.disk_uuid, metadata.osd_ids())
            .await?;
    }

    let conn = connect_as_admin(ctx.factory.as_ref(), info).await?;
    let mut total = failed;
    for entry in &scheme.entries {
        let Ok(data) = entry.data() else {
            continue;
        };
        if !mapping.entries.contains_key(&data.device) {
            debug!("Skipping osd {} on undesired device {}", entry.id, data.device);
            continue;
        }
        total += 1;
        let mut osd = OsdInstance::for_device(entry.clone(), ctx.config_dir());
        if let Err(e) = start_osd(ctx, info, conn.as_ref(), &mut osd, store).await {
            error!("Failed to configure osd {} on {}: {}", entry.id, data.device, e);
            failed += 1;
        }
    }
    conn.shutdown().await;

    info!("{}/{} osd devices succeeded on node {}", total - failed, total, ctx.node_id);
    if failed > 0 {
        return Err(Error::external(format!("{failed} of {total} osd devices failed")));
    }
    Ok(())
}

/// Remove applied OSDs that no desired device or directory refers to
async fn remove_undesired(ctx: &AgentContext, info: &ClusterInfo) -> Result<()> {
    // applied before desired: an OSD is associated before it is applied
    let applied = applied_osds(ctx.store.as_ref(), &ctx.node_id).await?;
    let desired = desired_osd_ids(ctx.store.as_ref(), &ctx.node_id).await?;
    let undesired: Vec<u32> = applied.keys().filter(|id| !desired.contains(id)).copied().collect();
    if undesired.is_empty() {
        return Ok(());
    }

    let conn = connect_as_admin(ctx.factory.as_ref(), info).await?;
    let mut last_err = None;
    for id in undesired {
        if let Err(e) = remove_osd(ctx, conn.as_ref(), id).await {
            error!("Failed to remove osd {}: {}", id, e);
            last_err = Some(e);
        }
    }
    conn.shutdown().await;
    last_err.map_or(Ok(()), Err)
}
