//! Wiring for `castled run` and the store used by every subcommand

use crate::settings::resolve_node_id;
use anyhow::{Context, Result};
use castle_agent::AgentContext;
use castle_agent::context::local_hostname;
use castle_cluster::CephCliFactory;
use castle_common::Config;
use castle_common::config::{StoreBackend, StoreConfig};
use castle_inventory::LocalInventory;
use castle_kv::{EtcdStore, KvStore, MemoryStore};
use castle_orchestrator::ClusterMember;
use castle_supervisor::{CommandExecutor, Executor, ProcessManager};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How often the process-local stores drop expired keys
const REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Connect to the configured coordination store
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            store.spawn_reaper(REAPER_INTERVAL);
            Ok(store)
        }
        StoreBackend::Local => {
            if let Some(parent) = config.path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let store = Arc::new(
                MemoryStore::open(&config.path)
                    .with_context(|| format!("Failed to open store {}", config.path.display()))?,
            );
            store.spawn_reaper(REAPER_INTERVAL);
            info!("Using local store {}", config.path.display());
            Ok(store)
        }
        StoreBackend::Etcd => {
            let store = EtcdStore::new(config.endpoints.clone(), Duration::from_millis(config.timeout_ms))
                .context("Failed to set up the etcd client")?;
            info!("Using etcd at {:?}", config.endpoints);
            Ok(Arc::new(store))
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install the SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = terminate => {}
    }
    info!("Shutting down...");
}

/// Run this node until it is told to stop
pub async fn run(mut config: Config) -> Result<()> {
    let node_id = resolve_node_id(&config)?;
    config.node.id.clone_from(&node_id);
    if config.node.public_ip.is_empty() {
        warn!("No public IP configured for node {}; it cannot host monitors", node_id);
    }

    let store = open_store(&config.store)?;
    let executor: Arc<dyn Executor> = Arc::new(CommandExecutor::new());
    let supervisor = Arc::new(ProcessManager::new(config.timing.stop_grace()));
    let factory = Arc::new(CephCliFactory::new(config.cluster.config_dir.clone(), Arc::clone(&executor)));
    let hostname = local_hostname().unwrap_or_else(|| node_id.clone());
    info!("Starting castle node {} on host {}", node_id, hostname);

    let ctx = AgentContext {
        node_id,
        hostname,
        config_dir: config.cluster.config_dir.clone(),
        store,
        supervisor,
        executor,
        factory,
        inventory: Arc::new(RwLock::new(LocalInventory::default())),
        config: Arc::new(config),
    };
    ClusterMember::new(ctx, castle_services::agents(), castle_services::leaders())
        .run(shutdown_signal())
        .await?;
    info!("Castle node shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            backend: StoreBackend::Local,
            path: dir.path().join("db").join("store.redb"),
            ..StoreConfig::default()
        };
        let store = open_store(&config).unwrap();
        store.set("/castle/x", "1", None).await.unwrap();
        assert_eq!(store.get("/castle/x").await.unwrap(), "1");
    }
}
