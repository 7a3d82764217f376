//! One node's membership in the cluster
//!
//! Every node registers itself, keeps its heartbeat alive and runs its
//! agents. All nodes compete for the leader lease; the holder also runs
//! the leader loop until it loses the lease or shuts down.

use crate::election::{Leadership, LeaseManager};
use crate::leader::{Leader, LeaderHandle, RETRY_BACKOFF};
use castle_agent::{Agent, AgentContext, AgentRunner};
use castle_common::Result;
use castle_inventory::disk::discover_disks;
use castle_inventory::node::{set_ip_address, set_location, store_disks};
use castle_inventory::{Heartbeat, LocalInventory};
use castle_services::ServiceLeader;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub struct ClusterMember {
    ctx: AgentContext,
    agents: Vec<Arc<dyn Agent>>,
    services: Vec<Arc<dyn ServiceLeader>>,
}

impl ClusterMember {
    pub fn new(ctx: AgentContext, agents: Vec<Arc<dyn Agent>>, services: Vec<Arc<dyn ServiceLeader>>) -> Self {
        Self { ctx, agents, services }
    }

    /// Publish this node's addresses, location and disks.
    ///
    /// Disk discovery failing is not fatal; the disks known so far are
    /// published instead.
    pub async fn register(&self) -> Result<()> {
        let store = self.ctx.store.as_ref();
        let node = &self.ctx.config.node;
        set_ip_address(store, &self.ctx.node_id, &node.public_ip, &node.private_ip).await?;
        if !node.location.is_empty() {
            set_location(store, &self.ctx.node_id, &node.location).await?;
        }

        match discover_disks(self.ctx.executor.as_ref()).await {
            Ok(disks) => *self.ctx.inventory.write() = LocalInventory::new(disks),
            Err(e) => warn!("Failed to discover disks on node {}: {}", self.ctx.node_id, e),
        }
        let disks = self.ctx.inventory.read().disks.clone();
        store_disks(store, &self.ctx.node_id, &disks).await?;
        info!(
            "Registered node {} at {} with {} disks",
            self.ctx.node_id,
            node.public_ip,
            disks.len()
        );
        Ok(())
    }

    async fn start_leading(&self) -> Result<LeaderHandle> {
        Leader::new(
            Arc::clone(&self.ctx.store),
            Arc::clone(&self.ctx.factory),
            Arc::clone(&self.ctx.config),
            self.services.clone(),
        )
        .spawn()
        .await
    }

    /// Run until `shutdown` completes, then stop every daemon of this node
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let timing = &self.ctx.config.timing;
        self.register().await?;

        let heartbeat = Heartbeat::new(Arc::clone(&self.ctx.store), self.ctx.node_id.clone(), timing.heartbeat_ttl());
        heartbeat.beat().await?;
        let heartbeat = heartbeat.spawn();

        let runner = Arc::new(AgentRunner::new(self.ctx.clone(), self.agents.clone()));
        runner.initialize().await;
        let runner_task = tokio::spawn(Arc::clone(&runner).run());

        let lease = LeaseManager::new(Arc::clone(&self.ctx.store), self.ctx.node_id.clone(), timing.lease_ttl());
        let (lease_tx, mut lease_rx) = mpsc::channel(8);
        let election = lease.clone().spawn(lease_tx);

        let mut leading: Option<LeaderHandle> = None;
        // holds the lease but the loop failed to start
        let mut stalled = false;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                event = lease_rx.recv() => match event {
                    Some(Leadership::Acquired) => match self.start_leading().await {
                        Ok(handle) => leading = Some(handle),
                        Err(e) => {
                            error!("Failed to start the leader loop: {}", e);
                            stalled = true;
                        }
                    },
                    Some(Leadership::Lost) => {
                        stalled = false;
                        if let Some(handle) = leading.take() {
                            handle.stop(timing.stop_grace()).await;
                        }
                    }
                    None => break,
                },
                () = tokio::time::sleep(RETRY_BACKOFF), if stalled => {
                    match self.start_leading().await {
                        Ok(handle) => {
                            leading = Some(handle);
                            stalled = false;
                        }
                        Err(e) => error!("Failed to start the leader loop: {}", e),
                    }
                }
            }
        }

        info!("Node {} shutting down", self.ctx.node_id);
        if let Some(handle) = leading.take() {
            handle.stop(timing.stop_grace()).await;
        }
        election.abort();
        if let Err(e) = lease.release().await {
            warn!("Failed to release the leader lease: {}", e);
        }
        runner_task.abort();
        heartbeat.abort();
        runner.destroy_all().await;
        self.ctx.supervisor.stop_all().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use castle_agent::testing::TestContext;
    use castle_common::keys::{self, LEADER_LEASE};
    use castle_common::Config;
    use castle_kv::{KvStore, path};
    use castle_services::LeaderContext;
    use castle_supervisor::{StartPolicy, Supervisor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    const LSBLK: &str = concat!(
        "NAME=\"sda\" SIZE=\"107374182400\" TYPE=\"disk\" RO=\"0\" PKNAME=\"\" FSTYPE=\"\" MOUNTPOINT=\"\"\n",
        "NAME=\"sdb\" SIZE=\"10737418240\" TYPE=\"disk\" RO=\"0\" PKNAME=\"\" FSTYPE=\"\" MOUNTPOINT=\"\"\n",
    );

    #[derive(Default)]
    struct CountingLeader {
        passes: AtomicUsize,
    }

    #[async_trait]
    impl ServiceLeader for CountingLeader {
        fn name(&self) -> &str {
            "counting"
        }

        async fn configure(&self, _ctx: &LeaderContext) -> Result<()> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_context() -> TestContext {
        let mut config = Config::default();
        config.node.public_ip = "1.2.3.4".to_string();
        config.node.private_ip = "10.0.0.1".to_string();
        config.node.location = "rack=r1".to_string();
        TestContext::with_config("a", config)
    }

    #[tokio::test]
    async fn test_register() {
        let t = test_context();
        t.executor.on("lsblk", LSBLK);
        let member = ClusterMember::new(t.ctx.clone(), Vec::new(), Vec::new());
        member.register().await.unwrap();

        let root = keys::node_config("a");
        assert_eq!(t.store.get(&path::join(&root, "publicIp")).await.unwrap(), "1.2.3.4");
        assert_eq!(t.store.get(&path::join(&root, "location")).await.unwrap(), "rack=r1");
        assert_eq!(t.ctx.inventory.read().disks.len(), 2);
        let published = castle_inventory::node::load_disks(t.store.as_ref(), "a").await.unwrap();
        assert_eq!(published.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_discovery_keeps_known_disks() {
        let t = test_context();
        t.executor.fail_on("lsblk", 1, "lsblk: not found");
        let member = ClusterMember::new(t.ctx.clone(), Vec::new(), Vec::new());
        member.register().await.unwrap();
        assert!(t.ctx.inventory.read().disks.is_empty());
    }

    #[tokio::test]
    async fn test_member_leads_and_shuts_down() {
        let t = test_context();
        let leader = Arc::new(CountingLeader::default());
        let member = ClusterMember::new(t.ctx.clone(), Vec::new(), vec![leader.clone() as Arc<dyn ServiceLeader>]);
        t.supervisor
            .start("mon0", "ceph-mon", "--name=mon\\.mon0", StartPolicy::ReuseExisting, &[])
            .await
            .unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(member.run(async {
            let _ = stop_rx.await;
        }));

        while leader.passes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(t.store.get(LEADER_LEASE).await.unwrap(), "a");
        assert!(t.store.get(&keys::node_heartbeat("a")).await.is_ok());

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(t.store.get(LEADER_LEASE).await.unwrap_err().is_not_found());
        assert!(t.supervisor.running().is_empty());
        assert_eq!(t.supervisor.stops(), vec!["mon0"]);
    }
}
