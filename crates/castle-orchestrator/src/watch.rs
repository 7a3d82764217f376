//! Store watchers that feed the leader loop

use crate::leader::LeaderEvent;
use castle_common::Result;
use castle_common::keys::NODES_CONFIG;
use castle_kv::util::child_keys;
use castle_kv::{EventKind, KvStore, WatchEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Follow `key` recursively from `index`, turning events into leader
/// events with `map`. Returns once the leader loop is gone.
async fn follow<F>(
    store: Arc<dyn KvStore>,
    key: String,
    mut index: Option<u64>,
    events: mpsc::Sender<LeaderEvent>,
    mut map: F,
) where
    F: FnMut(&WatchEvent) -> Option<LeaderEvent> + Send,
{
    loop {
        let mut watcher = match store.watch(&key, true, index).await {
            Ok(watcher) => watcher,
            Err(e) => {
                // the history may have moved past `index`; start over and
                // let a full pass pick up whatever was missed
                warn!("Failed to watch {}: {}", key, e);
                index = None;
                if events.send(LeaderEvent::Refresh).await.is_err() {
                    return;
                }
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
                continue;
            }
        };
        while let Some(item) = watcher.next().await {
            match item {
                Ok(event) => {
                    if let Some(leader_event) = map(&event)
                        && events.send(leader_event).await.is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Watch on {} broke: {}", key, e);
                    break;
                }
            }
        }
        index = Some(watcher.last_index());
        tokio::time::sleep(WATCH_RETRY_DELAY).await;
    }
}

/// Send `RefreshKey(key)` for every change below `key`.
///
/// Rewrites that leave a value unchanged are skipped; leaders rewrite
/// markers such as `ready` on every pass.
pub async fn spawn_refresh_watcher(
    store: Arc<dyn KvStore>,
    key: String,
    events: mpsc::Sender<LeaderEvent>,
) -> Result<JoinHandle<()>> {
    let index = store.current_index().await?;
    let refresh = key.clone();
    Ok(tokio::spawn(follow(store, key, Some(index), events, move |event| {
        if event.kind == EventKind::Update && event.prev_value == event.value {
            return None;
        }
        debug!("Change of {} under {}", event.key, refresh);
        Some(LeaderEvent::RefreshKey(refresh.clone()))
    })))
}

/// Node a key of the node config tree belongs to, and whether the key is
/// the node's own directory
fn node_of(key: &str) -> Option<(&str, bool)> {
    let rest = key.strip_prefix(NODES_CONFIG)?.strip_prefix('/')?;
    let (node, tail) = rest.split_once('/').unwrap_or((rest, ""));
    (!node.is_empty()).then_some((node, tail.is_empty()))
}

/// Classify changes of the node config tree: the first write of an unseen
/// node is `NodeAdded`, deleting a node's directory is `NodeRemoved`,
/// anything else is `NodesChanged`.
pub async fn spawn_node_watcher(
    store: Arc<dyn KvStore>,
    events: mpsc::Sender<LeaderEvent>,
) -> Result<JoinHandle<()>> {
    let index = store.current_index().await?;
    let mut known = child_keys(store.as_ref(), NODES_CONFIG).await?;
    Ok(tokio::spawn(follow(
        store,
        NODES_CONFIG.to_string(),
        Some(index),
        events,
        move |event| {
            let (node, is_root) = node_of(&event.key)?;
            let gone = matches!(event.kind, EventKind::Delete | EventKind::Expire);
            if gone && is_root {
                known.remove(node);
                Some(LeaderEvent::NodeRemoved(node.to_string()))
            } else if !gone && known.insert(node.to_string()) {
                Some(LeaderEvent::NodeAdded(node.to_string()))
            } else {
                Some(LeaderEvent::NodesChanged)
            }
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_common::keys::{self, service};
    use castle_kv::MemoryStore;
    use castle_kv::path;

    #[test]
    fn test_node_of() {
        let root = keys::node_config("a");
        assert_eq!(node_of(&root), Some(("a", true)));
        assert_eq!(node_of(&path::join(&root, "publicIp")), Some(("a", false)));
        assert_eq!(node_of(NODES_CONFIG), None);
        assert_eq!(node_of("/castle/nodes/configx/a"), None);
    }

    #[tokio::test]
    async fn test_node_events() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(&path::join(&keys::node_config("a"), "publicIp"), "1.2.3.4", None)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let task = spawn_node_watcher(store.clone(), tx).await.unwrap();

        store
            .set(&path::join(&keys::node_config("a"), "location"), "rack=r1", None)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(LeaderEvent::NodesChanged));

        let b = keys::node_config("b");
        store.set(&path::join(&b, "publicIp"), "2.3.4.5", None).await.unwrap();
        store.set(&path::join(&b, "privateIp"), "10.0.0.2", None).await.unwrap();
        assert_eq!(rx.recv().await, Some(LeaderEvent::NodeAdded("b".to_string())));
        assert_eq!(rx.recv().await, Some(LeaderEvent::NodesChanged));

        store.delete(&b, true).await.unwrap();
        assert_eq!(rx.recv().await, Some(LeaderEvent::NodeRemoved("b".to_string())));
        task.abort();
    }

    #[tokio::test]
    async fn test_refresh_skips_unchanged_rewrites() {
        let store = Arc::new(MemoryStore::new());
        let key = keys::service_state(service::OSD, false);
        let ready = keys::osd_ready("a");
        let (tx, mut rx) = mpsc::channel(16);
        let task = spawn_refresh_watcher(store.clone(), key.clone(), tx).await.unwrap();

        store.set(&ready, "1", None).await.unwrap();
        store.set(&ready, "1", None).await.unwrap();
        store.set(&ready, "0", None).await.unwrap();
        assert_eq!(rx.recv().await, Some(LeaderEvent::RefreshKey(key.clone())));
        assert_eq!(rx.recv().await, Some(LeaderEvent::RefreshKey(key.clone())));
        assert!(rx.try_recv().is_err());
        task.abort();
    }
}
