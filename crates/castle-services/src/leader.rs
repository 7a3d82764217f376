//! Leader side of a service

use async_trait::async_trait;
use castle_cluster::connection::connect_as_admin;
use castle_cluster::{ClusterConnection, ClusterInfo, ConnectionFactory};
use castle_common::{Config, Error, Result};
use castle_inventory::Inventory;
use castle_kv::KvStore;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// What a leader pass works with
#[derive(Clone)]
pub struct LeaderContext {
    pub store: Arc<dyn KvStore>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub config: Arc<Config>,
    /// Inventory as loaded at the start of the pass
    pub inventory: Inventory,
    /// Nodes announced as added since the previous pass
    pub added_nodes: BTreeSet<String>,
}

impl LeaderContext {
    pub fn new(store: Arc<dyn KvStore>, factory: Arc<dyn ConnectionFactory>, config: Arc<Config>) -> Self {
        Self {
            store,
            factory,
            config,
            inventory: Inventory::default(),
            added_nodes: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config.cluster.config_dir
    }

    #[must_use]
    pub fn agent_timeout(&self) -> Duration {
        self.config.timing.agent_timeout()
    }

    /// Mint the cluster identity on first use, load it afterwards
    pub async fn bootstrap(&self) -> Result<ClusterInfo> {
        ClusterInfo::create_or_get(
            self.store.as_ref(),
            &self.config.cluster.name,
            self.config.cluster.admin_secret.as_deref(),
        )
        .await
    }

    /// The bootstrapped cluster identity
    pub async fn cluster_info(&self) -> Result<ClusterInfo> {
        ClusterInfo::load(self.store.as_ref())
            .await?
            .ok_or_else(|| Error::unavailable("cluster has not been bootstrapped"))
    }

    pub async fn admin_connection(&self, info: &ClusterInfo) -> Result<Box<dyn ClusterConnection>> {
        connect_as_admin(self.factory.as_ref(), info).await
    }
}

/// Drives one service from its desired state towards applied state.
///
/// `configure` runs on every leader pass and must be idempotent; it returns
/// early when nothing diverges.
#[async_trait]
pub trait ServiceLeader: Send + Sync {
    fn name(&self) -> &str;

    /// Store subtrees whose changes call for a pass
    fn refresh_keys(&self) -> Vec<String> {
        Vec::new()
    }

    async fn configure(&self, ctx: &LeaderContext) -> Result<()>;
}

/// Treat a missing target as already handled
pub(crate) fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
