//! Node heartbeat

use castle_common::keys;
use castle_common::Result;
use castle_kv::KvStore;
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Keeps `/castle/nodes/health/<node>/heartbeat` alive.
///
/// The key carries a TTL and is rewritten every third of it, so a node that
/// stops beating drops out of the health tree on its own.
pub struct Heartbeat {
    store: Arc<dyn KvStore>,
    node_id: String,
    ttl: Duration,
}

impl Heartbeat {
    pub fn new(store: Arc<dyn KvStore>, node_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            ttl,
        }
    }

    /// Write the heartbeat once
    pub async fn beat(&self) -> Result<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.store
            .set(&keys::node_heartbeat(&self.node_id), &now, Some(self.ttl))
            .await?;
        debug!("Heartbeat for node {}", self.node_id);
        Ok(())
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.ttl / 3
    }

    /// Beat every `ttl / 3` until the task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval());
            loop {
                ticker.tick().await;
                if let Err(e) = self.beat().await {
                    warn!("Failed to write heartbeat for node {}: {}", self.node_id, e);
                }
            }
        })
    }
}
