//! Runs the object gateway placed on this node

use super::{RGW_ENTITY, keyring_key, load_gateways};
use async_trait::async_trait;
use castle_agent::{Agent, AgentContext};
use castle_cluster::conf::{GlobalConfig, generate_config_file};
use castle_cluster::{keyring, paths};
use castle_common::config::StoreType;
use castle_common::{Error, Result};
use castle_kv::util::get_optional;
use castle_supervisor::StartPolicy;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const RGW_AGENT: &str = "rgw";
pub const RGW_BINARY: &str = "radosgw";

/// Supervisor id of the gateway; a node runs at most one
const PROCESS_ID: &str = "rgw";

#[derive(Debug, Default)]
pub struct RgwAgent;

impl RgwAgent {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

async fn start_gateway(ctx: &AgentContext) -> Result<()> {
    let info = ctx
        .cluster_info()
        .await?
        .ok_or_else(|| Error::unavailable("cluster has not been bootstrapped"))?;
    let secret = get_optional(ctx.store.as_ref(), &keyring_key())
        .await?
        .ok_or_else(|| Error::unavailable("object gateway keyring has not been created"))?;

    let root = paths::rgw_root(ctx.config_dir());
    let keyring_path = root.join("keyring");
    keyring::write_keyring(&keyring_path, &secret)?;
    let global = GlobalConfig::new(&info, &root, StoreType::default());
    let config = generate_config_file(&info, &root, &global, RGW_ENTITY, &keyring_path, &BTreeMap::new())?;

    let port = ctx.config.rgw.port;
    let args = vec![
        "--foreground".to_string(),
        format!("--cluster={}", info.name),
        format!("--name={RGW_ENTITY}"),
        format!("--rgw-port={port}"),
        format!("--conf={}", config.display()),
        format!("--keyring={}", keyring_path.display()),
    ];
    info!("Starting object gateway on port {}", port);
    ctx.supervisor
        .start(
            PROCESS_ID,
            RGW_BINARY,
            &format!("--name={}", RGW_ENTITY.replace('.', "\\.")),
            StartPolicy::ReuseExisting,
            &args,
        )
        .await?;
    Ok(())
}

async fn stop_gateway(ctx: &AgentContext) -> Result<()> {
    info!("Stopping object gateway on node {}", ctx.node_id);
    ctx.supervisor.stop(PROCESS_ID).await?;
    let root = paths::rgw_root(ctx.config_dir());
    if let Err(e) = std::fs::remove_dir_all(&root)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", root.display(), e);
    }
    Ok(())
}

#[async_trait]
impl Agent for RgwAgent {
    fn name(&self) -> &str {
        RGW_AGENT
    }

    async fn initialize(&self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    async fn reconcile_local(&self, ctx: &AgentContext) -> Result<()> {
        if load_gateways(ctx.store.as_ref(), false).await?.contains(&ctx.node_id) {
            start_gateway(ctx).await
        } else if load_gateways(ctx.store.as_ref(), true).await?.contains(&ctx.node_id) {
            stop_gateway(ctx).await
        } else {
            Ok(())
        }
    }

    async fn destroy_local(&self, ctx: &AgentContext) -> Result<()> {
        if ctx.supervisor.is_running(PROCESS_ID) {
            ctx.supervisor.stop(PROCESS_ID).await?;
        }
        Ok(())
    }
}
