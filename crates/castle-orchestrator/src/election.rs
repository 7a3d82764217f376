//! Lease-based leader election
//!
//! The lease is a single TTL key holding the holder's node id. It is taken
//! with a create-only compare-and-swap and kept alive by swapping the
//! node's own value back in every third of the TTL. A holder that stops
//! renewing loses the lease when the key expires.

use castle_common::Result;
use castle_common::keys::LEADER_LEASE;
use castle_kv::util::get_optional;
use castle_kv::{KvStore, TxnOp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Change of this node's leadership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leadership {
    Acquired,
    Lost,
}

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn KvStore>,
    node_id: String,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn KvStore>, node_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            ttl,
        }
    }

    #[must_use]
    pub fn renew_interval(&self) -> Duration {
        self.ttl / 3
    }

    /// Take the lease if it is free. Returns true when this node holds it
    /// afterwards, including when it already did.
    pub async fn try_acquire(&self) -> Result<bool> {
        match self
            .store
            .compare_and_swap(LEADER_LEASE, None, &self.node_id, Some(self.ttl))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => self.renew().await,
            Err(e) => Err(e.into()),
        }
    }

    /// Extend the lease; false when another node holds it or it lapsed
    pub async fn renew(&self) -> Result<bool> {
        match self
            .store
            .compare_and_swap(LEADER_LEASE, Some(&self.node_id), &self.node_id, Some(self.ttl))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() || e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Current lease holder
    pub async fn holder(&self) -> Result<Option<String>> {
        Ok(get_optional(self.store.as_ref(), LEADER_LEASE).await?)
    }

    /// Give the lease up if this node holds it
    pub async fn release(&self) -> Result<()> {
        let ops = vec![
            TxnOp::check(LEADER_LEASE, Some(self.node_id.clone())),
            TxnOp::Delete {
                key: LEADER_LEASE.to_string(),
                recursive: false,
            },
        ];
        match self.store.transaction(ops).await {
            Ok(_) => info!("Node {} released the leader lease", self.node_id),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!("Node {} did not hold the leader lease", self.node_id);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Compete for the lease until the task is aborted, reporting every
    /// change of leadership on `events`.
    ///
    /// A store error does not end leadership by itself; the node steps
    /// down once a full TTL passed without a successful renewal.
    pub fn spawn(self, events: mpsc::Sender<Leadership>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.renew_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut leading = false;
            let mut last_held = Instant::now();
            loop {
                ticker.tick().await;
                let attempt = if leading {
                    self.renew().await
                } else {
                    self.try_acquire().await
                };
                let held = match attempt {
                    Ok(held) => {
                        if held {
                            last_held = Instant::now();
                        }
                        held
                    }
                    Err(e) => {
                        warn!("Failed to refresh leader lease for node {}: {}", self.node_id, e);
                        leading && last_held.elapsed() < self.ttl
                    }
                };
                if held == leading {
                    continue;
                }
                leading = held;
                let event = if leading {
                    info!("Node {} is now the leader", self.node_id);
                    Leadership::Acquired
                } else {
                    warn!("Node {} lost the leader lease", self.node_id);
                    Leadership::Lost
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_kv::MemoryStore;

    const TTL: Duration = Duration::from_secs(30);

    fn managers() -> (Arc<MemoryStore>, LeaseManager, LeaseManager) {
        let store = Arc::new(MemoryStore::new());
        let a = LeaseManager::new(store.clone(), "a", TTL);
        let b = LeaseManager::new(store.clone(), "b", TTL);
        (store, a, b)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_holder() {
        let (_store, a, b) = managers();
        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
        assert!(a.try_acquire().await.unwrap());
        assert!(a.renew().await.unwrap());
        assert!(!b.renew().await.unwrap());
        assert_eq!(b.holder().await.unwrap().as_deref(), Some("a"));

        // only the holder can release
        b.release().await.unwrap();
        assert_eq!(a.holder().await.unwrap().as_deref(), Some("a"));
        a.release().await.unwrap();
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_renewal() {
        let (_store, a, b) = managers();
        assert!(a.try_acquire().await.unwrap());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(a.renew().await.unwrap());
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!b.try_acquire().await.unwrap());

        tokio::time::advance(TTL).await;
        assert!(!a.renew().await.unwrap());
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_reports_transitions() {
        let (store, a, _b) = managers();
        let (tx, mut rx) = mpsc::channel(4);
        let task = a.spawn(tx);
        assert_eq!(rx.recv().await, Some(Leadership::Acquired));

        // another node took over
        store.set(LEADER_LEASE, "b", None).await.unwrap();
        assert_eq!(rx.recv().await, Some(Leadership::Lost));

        store.delete(LEADER_LEASE, false).await.unwrap();
        assert_eq!(rx.recv().await, Some(Leadership::Acquired));
        task.abort();
    }
}
