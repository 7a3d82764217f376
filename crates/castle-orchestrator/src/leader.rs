//! The leader event loop
//!
//! All placement decisions happen on one task. Events only say that
//! something may have changed; every pass re-reads the store and runs the
//! service leaders in order, so events queued while a pass runs collapse
//! into the next one.

use crate::watch::{spawn_node_watcher, spawn_refresh_watcher};
use castle_cluster::ConnectionFactory;
use castle_common::{Config, Error, Result};
use castle_inventory::Inventory;
use castle_kv::KvStore;
use castle_services::{LeaderContext, ServiceLeader};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Delay before a pass that hit an unavailable dependency runs again
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderEvent {
    Refresh,
    /// Something below a service's refresh key changed
    RefreshKey(String),
    NodeAdded(String),
    NodeRemoved(String),
    NodesChanged,
    Shutdown,
}

pub struct Leader {
    base: LeaderContext,
    services: Vec<Arc<dyn ServiceLeader>>,
    refresh_interval: Duration,
    retry_backoff: Duration,
}

impl Leader {
    pub fn new(
        store: Arc<dyn KvStore>,
        factory: Arc<dyn ConnectionFactory>,
        config: Arc<Config>,
        services: Vec<Arc<dyn ServiceLeader>>,
    ) -> Self {
        let refresh_interval = config.timing.refresh_interval();
        Self {
            base: LeaderContext::new(store, factory, config),
            services,
            refresh_interval,
            retry_backoff: RETRY_BACKOFF,
        }
    }

    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Store subtrees the services want passes for
    #[must_use]
    pub fn refresh_keys(&self) -> BTreeSet<String> {
        self.services.iter().flat_map(|s| s.refresh_keys()).collect()
    }

    /// Run every service once, in order.
    ///
    /// A failing service does not stop the ones after it. The pass fails
    /// only when some service found a dependency unavailable, so the loop
    /// knows to retry soon instead of waiting for the next refresh.
    pub async fn run_pass(&self, added_nodes: BTreeSet<String>) -> Result<()> {
        let mut ctx = self.base.clone();
        ctx.inventory = Inventory::load(ctx.store.as_ref()).await?;
        ctx.added_nodes = added_nodes;
        debug!("Leader pass over {} nodes", ctx.inventory.len());

        let mut unavailable: Option<Error> = None;
        for service in &self.services {
            if let Err(e) = service.configure(&ctx).await {
                error!("Failed to configure {}: {}", service.name(), e);
                if e.is_unavailable() && unavailable.is_none() {
                    unavailable = Some(e);
                }
            }
        }
        unavailable.map_or(Ok(()), Err)
    }

    /// Process events until `Shutdown` arrives or every sender is gone.
    ///
    /// The first pass runs right away; after that a pass runs for each
    /// batch of queued events and every refresh interval.
    pub async fn run(self, mut events: mpsc::Receiver<LeaderEvent>) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut added = BTreeSet::new();
        let mut next = LeaderEvent::Refresh;

        'events: loop {
            if !Self::absorb(next, &mut added) {
                break;
            }
            while let Ok(event) = events.try_recv() {
                if !Self::absorb(event, &mut added) {
                    break 'events;
                }
            }

            let batch = std::mem::take(&mut added);
            let retry_at = match self.run_pass(batch.clone()).await {
                Ok(()) => None,
                Err(e) => {
                    warn!("Leader pass incomplete, retrying in {:?}: {}", self.retry_backoff, e);
                    added.extend(batch);
                    Some(Instant::now() + self.retry_backoff)
                }
            };

            next = tokio::select! {
                _ = ticker.tick() => LeaderEvent::Refresh,
                () = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    LeaderEvent::Refresh
                }
                event = events.recv() => event.unwrap_or(LeaderEvent::Shutdown),
            };
        }
        info!("Leader loop stopping");
    }

    /// Fold one event into the pending batch; false on shutdown
    fn absorb(event: LeaderEvent, added: &mut BTreeSet<String>) -> bool {
        match event {
            LeaderEvent::Shutdown => return false,
            LeaderEvent::NodeAdded(node) => {
                info!("Node {} joined", node);
                added.insert(node);
            }
            LeaderEvent::NodeRemoved(node) => {
                info!("Node {} left", node);
                added.remove(&node);
            }
            LeaderEvent::RefreshKey(key) => debug!("Refresh requested by {}", key),
            LeaderEvent::Refresh | LeaderEvent::NodesChanged => {}
        }
        true
    }

    /// Start the watchers and the loop
    pub async fn spawn(self) -> Result<LeaderHandle> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let store = Arc::clone(&self.base.store);
        let mut watchers = Vec::new();
        for key in self.refresh_keys() {
            watchers.push(spawn_refresh_watcher(Arc::clone(&store), key, tx.clone()).await?);
        }
        watchers.push(spawn_node_watcher(store, tx.clone()).await?);
        let task = tokio::spawn(self.run(rx));
        Ok(LeaderHandle {
            events: tx,
            watchers,
            task,
        })
    }
}

/// A running leader loop and its watchers
pub struct LeaderHandle {
    events: mpsc::Sender<LeaderEvent>,
    watchers: Vec<JoinHandle<()>>,
    task: JoinHandle<()>,
}

impl LeaderHandle {
    /// Ask for a pass
    pub async fn refresh(&self) {
        let _ = self.events.send(LeaderEvent::Refresh).await;
    }

    /// Stop the loop, giving an in-flight pass `grace` to finish
    pub async fn stop(mut self, grace: Duration) {
        for watcher in &self.watchers {
            watcher.abort();
        }
        let _ = self.events.try_send(LeaderEvent::Shutdown);
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!("Leader pass did not finish within {:?}, aborting it", grace);
            self.task.abort();
        }
    }
}
