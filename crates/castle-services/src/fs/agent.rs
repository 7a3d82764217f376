//! Runs the metadata server assigned to this node

use super::{MdsAssignment, load_mds};
use async_trait::async_trait;
use castle_agent::{Agent, AgentContext};
use castle_cluster::conf::{GlobalConfig, generate_config_file};
use castle_cluster::connection::connect_as_admin;
use castle_cluster::keyring::{create_keyring, entity_keyring};
use castle_cluster::{ClusterInfo, paths};
use castle_common::config::StoreType;
use castle_common::{Error, Result};
use castle_supervisor::StartPolicy;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const MDS_AGENT: &str = "mds";
pub const MDS_BINARY: &str = "ceph-mds";

const MDS_CAPS: &[&str] = &["osd", "allow *", "mon", "allow profile mds", "mds", "allow"];

#[derive(Debug, Default)]
pub struct MdsAgent;

impl MdsAgent {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn process_id(mds: &MdsAssignment) -> String {
    format!("mds{}", mds.id)
}

fn keyring_path(root: &Path) -> PathBuf {
    root.join("keyring")
}

async fn write_config(ctx: &AgentContext, info: &ClusterInfo, mds: &MdsAssignment) -> Result<PathBuf> {
    let id = mds.id.to_string();
    let root = paths::mds_root(ctx.config_dir(), &id);
    let keyring = keyring_path(&root);
    let entity = format!("mds.{id}");

    if !keyring.exists() {
        let conn = connect_as_admin(ctx.factory.as_ref(), info).await?;
        let created = create_keyring(conn.as_ref(), &entity, MDS_CAPS, &keyring, |key| {
            entity_keyring(&entity, key)
        })
        .await;
        conn.shutdown().await;
        created?;
    }

    let global = GlobalConfig::new(info, &root, StoreType::default());
    generate_config_file(info, &root, &global, &entity, &keyring, &BTreeMap::new())
}

async fn start_mds(ctx: &AgentContext, mds: &MdsAssignment) -> Result<()> {
    let info = ctx
        .cluster_info()
        .await?
        .ok_or_else(|| Error::unavailable("cluster has not been bootstrapped"))?;
    let config = write_config(ctx, &info, mds).await?;
    let root = paths::mds_root(ctx.config_dir(), &mds.id.to_string());

    let args = vec![
        "--foreground".to_string(),
        format!("--cluster={}", info.name),
        format!("--id={}", mds.id),
        format!("--conf={}", config.display()),
        format!("--keyring={}", keyring_path(&root).display()),
    ];
    info!(
        "Starting metadata server {} for file system {}",
        mds.id, mds.filesystem
    );
    ctx.supervisor
        .start(
            &process_id(mds),
            MDS_BINARY,
            &format!("{MDS_BINARY} .*--id={}( |$)", mds.id),
            StartPolicy::ReuseExisting,
            &args,
        )
        .await?;
    Ok(())
}

async fn stop_mds(ctx: &AgentContext, mds: &MdsAssignment) -> Result<()> {
    info!("Stopping metadata server {} on node {}", mds.id, ctx.node_id);
    ctx.supervisor.stop(&process_id(mds)).await?;
    let root = paths::mds_root(ctx.config_dir(), &mds.id.to_string());
    if let Err(e) = std::fs::remove_dir_all(&root)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", root.display(), e);
    }
    Ok(())
}

#[async_trait]
impl Agent for MdsAgent {
    fn name(&self) -> &str {
        MDS_AGENT
    }

    async fn initialize(&self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    async fn reconcile_local(&self, ctx: &AgentContext) -> Result<()> {
        let desired = load_mds(ctx.store.as_ref(), false).await?.remove(&ctx.node_id);
        let applied = load_mds(ctx.store.as_ref(), true).await?.remove(&ctx.node_id);

        if let Some(old) = &applied
            && desired.as_ref().is_none_or(|mds| mds.id != old.id)
        {
            stop_mds(ctx, old).await?;
        }
        match desired {
            Some(mds) => start_mds(ctx, &mds).await,
            None => Ok(()),
        }
    }

    async fn destroy_local(&self, ctx: &AgentContext) -> Result<()> {
        let applied = load_mds(ctx.store.as_ref(), true).await?.remove(&ctx.node_id);
        if let Some(mds) = applied {
            ctx.supervisor.stop(&process_id(&mds)).await?;
        }
        Ok(())
    }
}
