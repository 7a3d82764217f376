//! In-process agent context for tests

use crate::context::AgentContext;
use castle_cluster::ClusterInfo;
use castle_cluster::testing::{MockConnectionFactory, sample_info};
use castle_common::Config;
use castle_common::keys::{self, STATUS_TRIGGER};
use castle_inventory::{LocalDisk, LocalInventory};
use castle_kv::{KvStore, MemoryStore, TxnOp};
use castle_supervisor::testing::{MockExecutor, RecordingSupervisor};
use parking_lot::RwLock;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// An [`AgentContext`] wired to fakes, plus handles on each fake
pub struct TestContext {
    pub ctx: AgentContext,
    pub store: Arc<MemoryStore>,
    pub supervisor: Arc<RecordingSupervisor>,
    pub executor: Arc<MockExecutor>,
    pub factory: MockConnectionFactory,
    pub dir: TempDir,
}

impl TestContext {
    /// # Panics
    /// If no temporary directory can be created.
    #[must_use]
    pub fn new(node_id: &str) -> Self {
        Self::with_config(node_id, Config::default())
    }

    /// # Panics
    /// If no temporary directory can be created.
    #[must_use]
    pub fn with_config(node_id: &str, mut config: Config) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        config.node.id = node_id.to_string();
        config.cluster.config_dir = dir.path().to_path_buf();
        let store = Arc::new(MemoryStore::new());
        let supervisor = Arc::new(RecordingSupervisor::new());
        let executor = Arc::new(MockExecutor::new());
        let factory = MockConnectionFactory::new();
        let ctx = AgentContext {
            node_id: node_id.to_string(),
            hostname: format!("host-{node_id}"),
            config_dir: dir.path().to_path_buf(),
            store: store.clone(),
            supervisor: supervisor.clone(),
            executor: executor.clone(),
            factory: Arc::new(factory.clone()),
            inventory: Arc::new(RwLock::new(LocalInventory::default())),
            config: Arc::new(config),
        };
        Self {
            ctx,
            store,
            supervisor,
            executor,
            factory,
            dir,
        }
    }

    /// Another node sharing this context's store and fakes
    ///
    /// # Panics
    /// If no temporary directory can be created.
    #[must_use]
    pub fn peer(&self, node_id: &str) -> AgentContext {
        let dir = tempfile::tempdir().expect("tempdir").keep();
        let mut config = (*self.ctx.config).clone();
        config.node.id = node_id.to_string();
        config.cluster.config_dir.clone_from(&dir);
        AgentContext {
            node_id: node_id.to_string(),
            hostname: format!("host-{node_id}"),
            config_dir: dir,
            inventory: Arc::new(RwLock::new(LocalInventory::default())),
            config: Arc::new(config),
            ..self.ctx.clone()
        }
    }

    /// Replace the local disk inventory
    pub fn set_disks(&self, disks: Vec<LocalDisk>) {
        *self.ctx.inventory.write() = LocalInventory::new(disks);
    }

    /// Store [`sample_info`] as the bootstrapped cluster
    ///
    /// # Panics
    /// If the in-memory store rejects the write.
    pub async fn seed_cluster(&self) -> ClusterInfo {
        let info = sample_info();
        seed_cluster_info(self.store.as_ref(), &info).await;
        info
    }
}

/// Write `info` the way the monitor leader leaves it
///
/// # Panics
/// If the store rejects the write.
pub async fn seed_cluster_info(store: &dyn KvStore, info: &ClusterInfo) {
    let mut ops = vec![
        TxnOp::set(keys::cluster_value("fsid"), info.fsid.clone()),
        TxnOp::set(keys::cluster_value("name"), info.name.clone()),
        TxnOp::set(keys::cluster_secret("monitor"), info.monitor_secret.clone()),
        TxnOp::set(keys::cluster_secret("admin"), info.admin_secret.clone()),
    ];
    for (node, mon) in &info.monitors {
        let (ip, port) = mon.endpoint.rsplit_once(':').unwrap_or((mon.endpoint.as_str(), ""));
        for applied in [false, true] {
            let root = keys::monitor_node(node, applied);
            ops.push(TxnOp::set(format!("{root}/id"), mon.name.clone()));
            ops.push(TxnOp::set(format!("{root}/ipaddress"), ip));
            ops.push(TxnOp::set(format!("{root}/port"), port));
        }
    }
    store.transaction(ops).await.expect("seed cluster info");
}

/// Stand in for the runners of remote nodes: answer every trigger of
/// `agent` with the status `reply` returns for the node
///
/// # Panics
/// If the store refuses the watch.
pub async fn answer_agents<F>(store: Arc<dyn KvStore>, agent: &str, reply: F) -> JoinHandle<()>
where
    F: Fn(&str) -> String + Send + 'static,
{
    let mut watcher = store
        .watch(keys::NOTIFY, true, None)
        .await
        .expect("watch notifications");
    let prefix = format!("{}/", keys::NOTIFY);
    let suffix = format!("/{agent}/status");
    tokio::spawn(async move {
        while let Some(Ok(event)) = watcher.next().await {
            if event.value.as_deref() != Some(STATUS_TRIGGER) {
                continue;
            }
            let Some(node) = event
                .key
                .strip_prefix(&prefix)
                .and_then(|k| k.strip_suffix(&suffix))
            else {
                continue;
            };
            let status = reply(node);
            if store.set(&event.key, &status, None).await.is_err() {
                break;
            }
        }
    })
}

/// [`answer_agents`] reporting success everywhere
///
/// # Panics
/// If the store refuses the watch.
pub async fn answer_succeeded(store: Arc<dyn KvStore>, agent: &str) -> JoinHandle<()> {
    answer_agents(store, agent, |_| keys::STATUS_SUCCEEDED.to_string()).await
}
