//! Runs the monitor assigned to this node

use super::monitor_properties;
use async_trait::async_trait;
use castle_agent::{Agent, AgentContext};
use castle_cluster::conf::{GlobalConfig, generate_config_file};
use castle_cluster::info::load_monitors;
use castle_cluster::{ClusterInfo, MonitorEndpoint, keyring, paths};
use castle_common::config::StoreType;
use castle_common::{Error, Result, keys};
use castle_kv::util::{delete_if_exists, get_tree_optional, store_properties};
use castle_supervisor::StartPolicy;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

pub const MON_AGENT: &str = "monitor";
pub const MON_BINARY: &str = "ceph-mon";

#[derive(Debug, Default)]
pub struct MonitorAgent;

impl MonitorAgent {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn config_path(ctx: &AgentContext, info: &ClusterInfo, name: &str) -> PathBuf {
    paths::config_file(&paths::mon_root(ctx.config_dir(), name), &info.name)
}

/// Keyring and config of the monitor
fn write_config(ctx: &AgentContext, info: &ClusterInfo, mon: &MonitorEndpoint) -> Result<()> {
    let root = paths::mon_root(ctx.config_dir(), &mon.name);
    let keyring_path = paths::mon_keyring(ctx.config_dir(), &mon.name);
    keyring::write_keyring(
        &keyring_path,
        &keyring::mon_keyring(&info.monitor_secret, &info.admin_secret),
    )?;
    let global = GlobalConfig::new(info, &root, StoreType::default());
    let settings = BTreeMap::from([("public addr".to_string(), mon.endpoint.clone())]);
    generate_config_file(
        info,
        &root,
        &global,
        &format!("mon.{}", mon.name),
        &keyring_path,
        &settings,
    )?;
    Ok(())
}

fn common_args(ctx: &AgentContext, info: &ClusterInfo, name: &str) -> Vec<String> {
    vec![
        format!("--cluster={}", info.name),
        format!("--name=mon.{name}"),
        format!("--mon-data={}", paths::mon_data(ctx.config_dir(), name).display()),
        format!("--conf={}", config_path(ctx, info, name).display()),
    ]
}

/// Create the monitor store unless a previous run already did
async fn make_fs(ctx: &AgentContext, info: &ClusterInfo, name: &str) -> Result<()> {
    if paths::mon_data(ctx.config_dir(), name).exists() {
        return Ok(());
    }
    info!("Creating the store of monitor {}", name);
    let mut mkfs = vec!["--mkfs".to_string()];
    mkfs.extend(common_args(ctx, info, name));
    mkfs.push(format!(
        "--keyring={}",
        paths::mon_keyring(ctx.config_dir(), name).display()
    ));
    ctx.supervisor.run(&format!("mkfs-{name}"), MON_BINARY, &mkfs).await
}

async fn start_monitor(ctx: &AgentContext, mon: &MonitorEndpoint) -> Result<()> {
    let info = ctx
        .cluster_info()
        .await?
        .ok_or_else(|| Error::unavailable("cluster has not been bootstrapped"))?;

    write_config(ctx, &info, mon)?;
    make_fs(ctx, &info, &mon.name).await?;

    let mut run = vec!["--foreground".to_string()];
    run.extend(common_args(ctx, &info, &mon.name));
    run.push(format!("--public-addr={}", mon.endpoint));
    info!("Starting monitor {} at {}", mon.name, mon.endpoint);
    ctx.supervisor
        .start(
            &mon.name,
            MON_BINARY,
            &format!("--name=mon\\.{}", mon.name),
            StartPolicy::ReuseExisting,
            &run,
        )
        .await?;

    store_properties(
        ctx.store.as_ref(),
        &keys::monitor_node(&ctx.node_id, true),
        &monitor_properties(mon),
    )
    .await?;
    Ok(())
}

/// Name of the monitor applied on this node
async fn applied_monitor(ctx: &AgentContext) -> Result<Option<String>> {
    let key = keys::monitor_node(&ctx.node_id, true);
    Ok(get_tree_optional(ctx.store.as_ref(), &key)
        .await?
        .and_then(|node| node.child_value(super::ID).map(str::to_string)))
}

/// Stop the monitor no longer wanted here and forget it
async fn remove_monitor(ctx: &AgentContext) -> Result<()> {
    let Some(name) = applied_monitor(ctx).await? else {
        return Ok(());
    };
    info!("Removing monitor {} from node {}", name, ctx.node_id);
    ctx.supervisor.stop(&name).await?;

    let root = paths::mon_root(ctx.config_dir(), &name);
    if let Err(e) = std::fs::remove_dir_all(&root)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", root.display(), e);
    }
    delete_if_exists(ctx.store.as_ref(), &keys::monitor_node(&ctx.node_id, true)).await?;
    Ok(())
}

#[async_trait]
impl Agent for MonitorAgent {
    fn name(&self) -> &str {
        MON_AGENT
    }

    async fn initialize(&self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    async fn reconcile_local(&self, ctx: &AgentContext) -> Result<()> {
        let desired = load_monitors(ctx.store.as_ref()).await?;
        match desired.get(&ctx.node_id) {
            Some(mon) => start_monitor(ctx, mon).await,
            None => remove_monitor(ctx).await,
        }
    }

    async fn destroy_local(&self, ctx: &AgentContext) -> Result<()> {
        if let Some(name) = applied_monitor(ctx).await? {
            ctx.supervisor.stop(&name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_agent::testing::TestContext;
    use castle_kv::KvStore;

    #[tokio::test]
    async fn test_start_monitor() {
        let t = TestContext::new("a");
        let info = t.seed_cluster().await;
        MonitorAgent::new().reconcile_local(&t.ctx).await.unwrap();

        let runs = t.supervisor.runs();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].starts_with("mkfs-mon0: ceph-mon --mkfs --cluster=c1 --name=mon.mon0"));

        let starts = t.supervisor.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].id, "mon0");
        assert_eq!(starts[0].pattern, "--name=mon\\.mon0");
        assert!(starts[0].args.contains(&"--public-addr=1.2.3.4:6790".to_string()));

        let keyring = std::fs::read_to_string(paths::mon_keyring(t.dir.path(), "mon0")).unwrap();
        assert!(keyring.starts_with("[mon.]\n\tkey = AQBmonsecret=="));
        let config = std::fs::read_to_string(config_path(&t.ctx, &info, "mon0")).unwrap();
        assert!(config.contains("[mon.mon0]"));
        assert!(config.contains("mon addr = 1.2.3.4:6790"));
    }

    #[tokio::test]
    async fn test_existing_store_skips_mkfs() {
        let t = TestContext::new("a");
        t.seed_cluster().await;
        std::fs::create_dir_all(paths::mon_data(t.dir.path(), "mon0")).unwrap();

        MonitorAgent::new().reconcile_local(&t.ctx).await.unwrap();
        assert!(t.supervisor.runs().is_empty());
        assert_eq!(t.supervisor.spawned(), vec!["mon0"]);
    }

    #[tokio::test]
    async fn test_applied_follows_desired() {
        let t = TestContext::new("a");
        t.seed_cluster().await;
        delete_if_exists(t.store.as_ref(), &keys::service_state("monitor", true))
            .await
            .unwrap();

        MonitorAgent::new().reconcile_local(&t.ctx).await.unwrap();
        let applied = keys::monitor_node("a", true);
        assert_eq!(t.store.get(&format!("{applied}/id")).await.unwrap(), "mon0");
        assert_eq!(t.store.get(&format!("{applied}/ipaddress")).await.unwrap(), "1.2.3.4");
        assert_eq!(t.store.get(&format!("{applied}/port")).await.unwrap(), "6790");
    }

    #[tokio::test]
    async fn test_undesired_monitor_removed() {
        let t = TestContext::new("a");
        t.seed_cluster().await;
        let agent = MonitorAgent::new();
        agent.reconcile_local(&t.ctx).await.unwrap();
        assert!(paths::mon_root(t.dir.path(), "mon0").exists());

        t.store
            .delete(&keys::monitor_node("a", false), true)
            .await
            .unwrap();
        agent.reconcile_local(&t.ctx).await.unwrap();

        assert_eq!(t.supervisor.stops(), vec!["mon0"]);
        assert!(!paths::mon_root(t.dir.path(), "mon0").exists());
        assert!(get_tree_optional(t.store.as_ref(), &keys::monitor_node("a", true))
            .await
            .unwrap()
            .is_none());

        // nothing left to remove
        agent.reconcile_local(&t.ctx).await.unwrap();
        assert_eq!(t.supervisor.stops().len(), 1);
    }

    #[tokio::test]
    async fn test_not_bootstrapped() {
        let t = TestContext::new("a");
        store_properties(
            t.store.as_ref(),
            &keys::monitor_node("a", false),
            &monitor_properties(&MonitorEndpoint::new("mon0", "1.2.3.4:6790")),
        )
        .await
        .unwrap();
        let err = MonitorAgent::new().reconcile_local(&t.ctx).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(t.supervisor.starts().is_empty());
    }
}
