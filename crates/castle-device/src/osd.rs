//! OSD lifecycle: registration, initialization, start and removal

use crate::desired::{associate_data, associate_metadata, remove_desired_device};
use crate::partition::partition_osd;
use crate::scheme::{PartitionRole, PartitionScheme, SchemeEntry, StoreConfig};
use castle_agent::AgentContext;
use castle_cluster::commands::{
    auth_add, auth_del, crush_weight, get_monmap, osd_create, osd_crush_create_or_move,
    osd_crush_remove, osd_out, osd_rm,
};
use castle_cluster::conf::{GlobalConfig, generate_config_file};
use castle_cluster::crush::format_location;
use castle_cluster::{ClusterConnection, ClusterInfo, paths};
use castle_common::config::StoreType;
use castle_common::{Error, Result, keys};
use castle_inventory::disk::parse_pairs;
use castle_inventory::node::set_location;
use castle_kv::util::{delete_if_exists, get_tree_optional, store_properties};
use castle_kv::{KvStore, path};
use castle_supervisor::{StartPolicy, args};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

pub const OSD_BINARY: &str = "ceph-osd";
const WHOAMI: &str = "whoami";
const FSID: &str = "fsid";
const APPLIED_PATH: &str = "path";
const DATA_DISK_UUID: &str = "data-disk-uuid";
const METADATA_DISK_UUID: &str = "metadata-disk-uuid";
const OSD_CAPS: &[&str] = &["osd", "allow *", "mon", "allow profile osd"];

/// An OSD being brought up on this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsdInstance {
    pub id: u32,
    pub uuid: String,
    /// Directory holding `osd<id>`: the config dir for device OSDs, the
    /// backing directory otherwise
    pub config_root: PathBuf,
    /// Partition layout of a device OSD; `None` for directory OSDs
    pub scheme: Option<SchemeEntry>,
}

impl OsdInstance {
    pub fn for_dir(id: u32, uuid: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            uuid: uuid.into(),
            config_root: dir.into(),
            scheme: None,
        }
    }

    pub fn for_device(entry: SchemeEntry, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: entry.id,
            uuid: entry.osd_uuid.clone(),
            config_root: config_dir.into(),
            scheme: Some(entry),
        }
    }

    /// Data directory, `<root>/osd<id>`
    #[must_use]
    pub fn root(&self) -> PathBuf {
        paths::osd_root(&self.config_root, self.id)
    }

    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.scheme.is_none()
    }

    /// Directory OSDs always use filestore
    #[must_use]
    pub fn store_type(&self) -> StoreType {
        self.scheme
            .as_ref()
            .map_or(StoreType::Filestore, |entry| entry.store_type)
    }

    #[must_use]
    pub fn is_bluestore(&self) -> bool {
        self.store_type() == StoreType::Bluestore
    }

    /// True until `--mkfs` has written `whoami`
    #[must_use]
    pub fn is_new(&self) -> bool {
        !self.root().join(WHOAMI).exists()
    }

    #[must_use]
    pub fn entity(&self) -> String {
        format!("osd.{}", self.id)
    }

    fn config_file(&self, cluster: &str) -> PathBuf {
        paths::config_file(&self.root(), cluster)
    }
}

/// Ask the monitors for a new OSD id bound to a fresh UUID
pub async fn register_osd(conn: &dyn ClusterConnection) -> Result<(u32, String)> {
    let uuid = Uuid::new_v4().to_string();
    let id = osd_create(conn, &uuid).await?;
    info!("Registered osd {} with uuid {}", id, uuid);
    Ok((id, uuid))
}

/// Read the id and UUID `--mkfs` left in an OSD data directory
pub fn load_osd_info(root: &Path) -> Result<(u32, String)> {
    let read = |name: &str| {
        let file = root.join(name);
        std::fs::read_to_string(&file)
            .map(|s| s.trim().to_string())
            .map_err(|e| Error::from(e).context(format!("reading {}", file.display())))
    };
    let whoami = read(WHOAMI)?;
    let id = whoami.parse().map_err(|_| {
        Error::invalid_input(format!("bad osd id '{whoami}' in {}", root.display()))
    })?;
    let fsid = read(FSID)?;
    let uuid = Uuid::parse_str(&fsid).map_err(|e| {
        Error::invalid_input(format!("bad osd uuid '{fsid}' in {}: {e}", root.display()))
    })?;
    Ok((id, uuid.to_string()))
}

/// Client settings pointing the daemon at its partitions or journal
pub fn store_settings(osd: &OsdInstance, store: &StoreConfig) -> Result<BTreeMap<String, String>> {
    let mut settings = BTreeMap::new();
    match &osd.scheme {
        Some(entry) if entry.store_type == StoreType::Bluestore => {
            for (key, role) in [
                ("bluestore block wal path", PartitionRole::Wal),
                ("bluestore block db path", PartitionRole::Db),
                ("bluestore block path", PartitionRole::Block),
            ] {
                settings.insert(key.to_string(), entry.role(role)?.path().display().to_string());
            }
        }
        _ => {
            settings.insert("osd journal size".to_string(), store.journal_mb().to_string());
        }
    }
    Ok(settings)
}

/// Render `<root>/osd<id>/<cluster>.config`
pub fn write_config_file(info: &ClusterInfo, osd: &OsdInstance, store: &StoreConfig) -> Result<PathBuf> {
    let root = osd.root();
    let mut global = GlobalConfig::new(info, &root, osd.store_type());
    if osd.is_dir() {
        global = global.for_directory_osd();
    }
    generate_config_file(
        info,
        &root,
        &global,
        &osd.entity(),
        &paths::osd_keyring(&root),
        &store_settings(osd, store)?,
    )
}

fn mkfs_args(info: &ClusterInfo, osd: &OsdInstance, monmap: &Path) -> Vec<String> {
    let root = osd.root();
    let mut mkfs = vec![
        "--mkfs".to_string(),
        "--mkkey".to_string(),
        format!("--id={}", osd.id),
        format!("--cluster={}", info.name),
        format!("--conf={}", osd.config_file(&info.name).display()),
        format!("--osd-data={}", root.display()),
        format!("--osd-uuid={}", osd.uuid),
        format!("--monmap={}", monmap.display()),
    ];
    if !osd.is_bluestore() {
        mkfs.push(format!("--osd-journal={}", paths::osd_journal(&root).display()));
        mkfs.push(format!("--keyring={}", paths::osd_keyring(&root).display()));
    }
    mkfs
}

fn run_args(info: &ClusterInfo, osd: &OsdInstance) -> Vec<String> {
    let root = osd.root();
    let mut run = vec![
        "--foreground".to_string(),
        format!("--id={}", osd.id),
        format!("--cluster={}", info.name),
        format!("--osd-data={}", root.display()),
        format!("--conf={}", osd.config_file(&info.name).display()),
        format!("--keyring={}", paths::osd_keyring(&root).display()),
        format!("--osd-uuid={}", osd.uuid),
    ];
    if !osd.is_bluestore() {
        run.push(format!("--osd-journal={}", paths::osd_journal(&root).display()));
    }
    run
}

/// Bytes of storage behind the OSD's data
async fn data_capacity(ctx: &AgentContext, osd: &OsdInstance) -> Result<u64> {
    if let Some(entry) = &osd.scheme
        && entry.store_type == StoreType::Bluestore
    {
        let device = entry.data()?.path().display().to_string();
        let output = ctx
            .executor
            .execute_with_output(
                &format!("read size of {device}"),
                "lsblk",
                &args([device.as_str(), "--bytes", "--nodeps", "--pairs", "--output", "SIZE"]),
            )
            .await?;
        let raw = output
            .lines()
            .map(parse_pairs)
            .find_map(|props| props.get("SIZE").cloned())
            .ok_or_else(|| Error::external(format!("no size reported for {device}")))?;
        return raw
            .parse()
            .map_err(|_| Error::external(format!("bad size '{raw}' for {device}")));
    }

    let stat = nix::sys::statvfs::statvfs(&osd.root())
        .map_err(|e| Error::external(format!("statfs {}: {e}", osd.root().display())))?;
    #[allow(clippy::useless_conversion)]
    let total = u64::from(stat.blocks()) * u64::from(stat.fragment_size());
    Ok(total)
}

/// Weigh the OSD by capacity and place it under this node's location
async fn add_to_crush(ctx: &AgentContext, info: &ClusterInfo, osd: &OsdInstance) -> Result<()> {
    let weight = crush_weight(data_capacity(ctx, osd).await?);
    let location = format_location(&ctx.config.node.location, &ctx.hostname)?;

    // the CLI looks for the OSD keyring under the config dir
    let keyring = paths::osd_keyring(&osd.root());
    let conn_keyring = paths::user_keyring(ctx.config_dir(), &info.name, &osd.entity());
    if conn_keyring != keyring && keyring.exists() {
        if let Some(dir) = conn_keyring.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::copy(&keyring, &conn_keyring)?;
    }

    let conn = ctx.factory.connect(info, &osd.entity()).await?;
    let result = osd_crush_create_or_move(conn.as_ref(), osd.id, weight, &location).await;
    conn.shutdown().await;
    result?;
    info!("Placed osd {} in crush at {} with weight {}", osd.id, location.join(","), weight);

    set_location(ctx.store.as_ref(), &ctx.node_id, &location.join(",")).await
}

/// Create the OSD's file store and keys and register it with the cluster
pub async fn initialize_osd(
    ctx: &AgentContext,
    info: &ClusterInfo,
    conn: &dyn ClusterConnection,
    osd: &OsdInstance,
    store: &StoreConfig,
) -> Result<()> {
    let root = osd.root();
    std::fs::create_dir_all(&root)?;
    write_config_file(info, osd, store)?;

    let monmap = paths::osd_temp_monmap(&root);
    if let Some(dir) = monmap.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&monmap, get_monmap(conn).await?)?;

    info!("Initializing osd {} at {}", osd.id, root.display());
    let mkfs = ctx
        .supervisor
        .run(&format!("mkfs-osd{}", osd.id), OSD_BINARY, &mkfs_args(info, osd, &monmap))
        .await;
    if let Err(e) = std::fs::remove_file(&monmap) {
        warn!("Failed to remove temp monmap {}: {}", monmap.display(), e);
    }
    mkfs?;

    let keyring_path = paths::osd_keyring(&root);
    let keyring = std::fs::read(&keyring_path)
        .map_err(|e| Error::from(e).context(format!("reading {}", keyring_path.display())))?;
    auth_add(conn, &osd.entity(), OSD_CAPS, &keyring).await?;

    add_to_crush(ctx, info, osd).await
}

/// Record the OSD under the node's applied state
pub async fn mark_applied(store: &dyn KvStore, node_id: &str, osd: &OsdInstance) -> Result<()> {
    let (data, metadata) = match &osd.scheme {
        Some(entry) => (entry.data()?.disk_uuid.clone(), entry.metadata()?.disk_uuid.clone()),
        None => (String::new(), String::new()),
    };
    let properties = BTreeMap::from([
        (APPLIED_PATH.to_string(), osd.config_root.display().to_string()),
        (DATA_DISK_UUID.to_string(), data),
        (METADATA_DISK_UUID.to_string(), metadata),
    ]);
    let key = path::join(&keys::osd_node(node_id, true), &osd.id.to_string());
    store_properties(store, &key, &properties).await?;
    Ok(())
}

/// Applied OSDs of a node with their data disk UUID (empty for directories)
pub async fn applied_osds(store: &dyn KvStore, node_id: &str) -> Result<BTreeMap<u32, String>> {
    let mut osds = BTreeMap::new();
    let Some(tree) = get_tree_optional(store, &keys::osd_node(node_id, true)).await? else {
        return Ok(osds);
    };
    for node in &tree.children {
        let Ok(id) = node.name().parse::<u32>() else {
            continue;
        };
        osds.insert(id, node.child_value(DATA_DISK_UUID).unwrap_or_default().to_string());
    }
    Ok(osds)
}

/// Start the daemon, adopting one that already runs with this UUID
pub async fn run_osd(ctx: &AgentContext, info: &ClusterInfo, osd: &OsdInstance) -> Result<()> {
    info!("Starting osd {} at {}", osd.id, osd.root().display());
    let pattern = regex::escape(&format!("--osd-uuid={}", osd.uuid));
    ctx.supervisor
        .start(
            &format!("osd{}", osd.id),
            OSD_BINARY,
            &pattern,
            StartPolicy::ReuseExisting,
            &run_args(info, osd),
        )
        .await?;
    Ok(())
}

/// Bring up one OSD: partition and initialize it when new, refresh its
/// config otherwise, then start it
pub async fn start_osd(
    ctx: &AgentContext,
    info: &ClusterInfo,
    conn: &dyn ClusterConnection,
    osd: &mut OsdInstance,
    store: &StoreConfig,
) -> Result<()> {
    if osd.is_new() {
        if let Some(entry) = &osd.scheme
            && PartitionScheme::load(ctx.config_dir())?.entry(entry.id).is_none()
        {
            let data = entry.data()?;
            let previous = ctx
                .inventory
                .read()
                .by_name(&data.device)
                .map(|d| d.uuid.clone())
                .unwrap_or_default();
            partition_osd(ctx, entry).await?;

            let store = ctx.store.as_ref();
            associate_data(store, &ctx.node_id, &data.disk_uuid, entry.id).await?;
            if entry.is_collocated() {
                associate_metadata(store, &ctx.node_id, &data.disk_uuid, [entry.id]).await?;
            }
            // the desired entry follows the new partition table
            if !previous.is_empty() && previous != data.disk_uuid {
                remove_desired_device(store, &ctx.node_id, &previous).await?;
            }
        }
        initialize_osd(ctx, info, conn, osd, store).await?;
        mark_applied(ctx.store.as_ref(), &ctx.node_id, osd).await?;
    } else {
        if let Err(e) = write_config_file(info, osd, store) {
            warn!("Failed to update config file of osd {}: {}", osd.id, e);
        }
        let (id, uuid) = load_osd_info(&osd.root())?;
        if id != osd.id {
            return Err(Error::conflict(format!(
                "{} belongs to osd {id}, expected osd {}",
                osd.root().display(),
                osd.id
            )));
        }
        osd.uuid = uuid;
    }
    run_osd(ctx, info, osd).await
}

fn tolerate_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Take an OSD out of the cluster and forget it on this node
pub async fn remove_osd(ctx: &AgentContext, conn: &dyn ClusterConnection, id: u32) -> Result<()> {
    info!("Removing osd {}", id);
    tolerate_missing(osd_out(conn, id).await)?;
    ctx.supervisor.stop(&format!("osd{id}")).await?;
    tolerate_missing(osd_crush_remove(conn, id).await)?;
    tolerate_missing(auth_del(conn, &format!("osd.{id}")).await)?;
    tolerate_missing(osd_rm(conn, id).await)?;
    delete_if_exists(
        ctx.store.as_ref(),
        &path::join(&keys::osd_node(&ctx.node_id, true), &id.to_string()),
    )
    .await?;

    // the partitions stay behind, labelled as ours, for reuse
    let mut saved = PartitionScheme::load(ctx.config_dir())?;
    if saved.entry(id).is_some() {
        saved.entries.retain(|e| e.id != id);
        saved.save(ctx.config_dir())?;
    }
    info!("Stopped and removed osd {}", id);
    Ok(())
}
