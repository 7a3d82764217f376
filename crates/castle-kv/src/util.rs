//! Convenience operations layered on [`KvStore`]

use crate::path;
use crate::store::{KvNode, KvStore, StoreError, StoreResult, TxnOp, WatchEvent};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Read a leaf, mapping `NotFound` to `None`
pub async fn get_optional(store: &dyn KvStore, key: &str) -> StoreResult<Option<String>> {
    match store.get(key).await {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read a subtree, mapping `NotFound` to `None`
pub async fn get_tree_optional(store: &dyn KvStore, key: &str) -> StoreResult<Option<KvNode>> {
    match store.get_recursive(key).await {
        Ok(node) => Ok(Some(node)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Names of the direct children of `key`; empty when `key` does not exist
pub async fn child_keys(store: &dyn KvStore, key: &str) -> StoreResult<BTreeSet<String>> {
    Ok(get_tree_optional(store, key)
        .await?
        .map(|node| node.child_names().map(str::to_string).collect())
        .unwrap_or_default())
}

/// Leaf children of `key` as a name to value map
pub async fn child_values(store: &dyn KvStore, key: &str) -> StoreResult<BTreeMap<String, String>> {
    let Some(node) = get_tree_optional(store, key).await? else {
        return Ok(BTreeMap::new());
    };
    Ok(node
        .children
        .iter()
        .filter_map(|c| c.value.as_ref().map(|v| (c.name().to_string(), v.clone())))
        .collect())
}

/// Write each property as a leaf under `key` in a single transaction
pub async fn store_properties(
    store: &dyn KvStore,
    key: &str,
    properties: &BTreeMap<String, String>,
) -> StoreResult<()> {
    if properties.is_empty() {
        return Ok(());
    }
    let ops = properties
        .iter()
        .map(|(name, value)| TxnOp::set(path::join(key, name), value.clone()))
        .collect();
    store.transaction(ops).await.map(|_| ())
}

/// Delete a key or subtree; a missing key is not an error
pub async fn delete_if_exists(store: &dyn KvStore, key: &str) -> StoreResult<()> {
    match store.delete(key, true).await {
        Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Wait for the next change to `key` after `*after_index`.
///
/// Returns `None` on timeout. `after_index` is advanced past the returned
/// event so repeated calls never miss or repeat changes.
pub async fn watch_key(
    store: &dyn KvStore,
    key: &str,
    after_index: &mut u64,
    timeout: Duration,
) -> StoreResult<Option<WatchEvent>> {
    let mut watcher = store.watch(key, false, Some(*after_index)).await?;
    match tokio::time::timeout(timeout, watcher.next()).await {
        Err(_) => Ok(None),
        Ok(None) => Err(StoreError::Unavailable(format!("watch on {key} closed"))),
        Ok(Some(Err(e))) => Err(e),
        Ok(Some(Ok(event))) => {
            *after_index = event.index;
            Ok(Some(event))
        }
    }
}
