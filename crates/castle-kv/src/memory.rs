//! In-process store backend
//!
//! Keeps the whole tree in a `BTreeMap` guarded by a mutex. Every mutation
//! bumps a single monotonically increasing index, and the most recent
//! events are kept so watchers can resume after a disconnect. When opened
//! with a path, non-TTL entries are written through to redb before the
//! in-memory commit.

use crate::path;
use crate::persist::{Change, Persist, Record};
use crate::store::{
    EventKind, KvNode, KvStore, StoreError, StoreResult, TxnOp, WatchEvent, Watcher,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

/// Number of events retained for watch resumption
const HISTORY_LIMIT: usize = 1000;
const BROADCAST_CAPACITY: usize = 1024;
const WATCH_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    /// `None` marks an explicit directory
    value: Option<String>,
    modified_index: u64,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history: VecDeque<WatchEvent>,
    /// Highest index evicted from `history`
    history_floor: u64,
}

impl Inner {
    fn record(&mut self, events: &[WatchEvent]) {
        for event in events {
            self.history.push_back(event.clone());
            if self.history.len() > HISTORY_LIMIT
                && let Some(evicted) = self.history.pop_front()
            {
                self.history_floor = evicted.index;
            }
        }
    }
}

/// In-memory [`KvStore`], optionally persisted to a redb file
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
    persist: Option<Persist>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty, purely in-memory store
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
            persist: None,
        }
    }

    /// Open a store backed by a redb file, loading any persisted entries
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let persist = Persist::open(path).map_err(|e| {
            StoreError::Unavailable(format!("failed to open {}: {e}", path.display()))
        })?;
        let (records, index) = persist.load().map_err(|e| {
            StoreError::Unavailable(format!("failed to load {}: {e}", path.display()))
        })?;

        let mut inner = Inner {
            index,
            history_floor: index,
            ..Inner::default()
        };
        for (key, record) in records {
            inner.entries.insert(
                key,
                Entry {
                    value: record.value,
                    modified_index: record.modified_index,
                    expires_at: None,
                },
            );
        }
        debug!(
            "Loaded {} store entries from {} at index {}",
            inner.entries.len(),
            path.display(),
            index
        );

        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Self {
            inner: Mutex::new(inner),
            events,
            persist: Some(persist),
        })
    }

    /// Periodically expire TTL keys even when nobody touches the store
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let mut inner = store.inner.lock();
                store.purge_expired(&mut inner);
            }
        })
    }

    fn publish(&self, events: Vec<WatchEvent>) {
        for event in events {
            // No receivers is fine
            let _ = self.events.send(event);
        }
    }

    fn purge_expired(&self, inner: &mut Inner) {
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|t| t <= now))
            .map(|(k, _)| k.clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        let mut events = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.index += 1;
                events.push(WatchEvent {
                    kind: EventKind::Expire,
                    key,
                    value: None,
                    prev_value: entry.value,
                    index: inner.index,
                });
            }
        }
        inner.record(&events);
        self.publish(events);
    }

    /// Run a mutation against the tree. Either every change lands (and is
    /// persisted) under a single new index, or none does.
    fn mutate<F>(&self, f: F) -> StoreResult<u64>
    where
        F: FnOnce(&mut Batch<'_>) -> StoreResult<()>,
    {
        let mut guard = self.inner.lock();
        self.purge_expired(&mut guard);
        let inner = &mut *guard;
        let index = inner.index + 1;

        let mut batch = Batch::new(&mut inner.entries, index);
        if let Err(e) = f(&mut batch) {
            batch.rollback();
            return Err(e);
        }
        if batch.events.is_empty() {
            batch.rollback();
            return Ok(inner.index);
        }
        if let Some(persist) = &self.persist
            && let Err(e) = persist.commit(&batch.changes, index)
        {
            error!("Failed to persist store change at index {}: {}", index, e);
            batch.rollback();
            return Err(StoreError::Unavailable(format!("persist failed: {e}")));
        }

        let events = batch.finish();
        inner.index = index;
        inner.record(&events);
        self.publish(events);
        Ok(index)
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> StoreResult<T>) -> StoreResult<T> {
        let mut inner = self.inner.lock();
        self.purge_expired(&mut inner);
        f(&inner)
    }
}

fn has_descendants(entries: &BTreeMap<String, Entry>, key: &str) -> bool {
    let prefix = path::descendant_prefix(key);
    entries
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(k, _)| k.starts_with(&prefix))
}

fn is_dir(entries: &BTreeMap<String, Entry>, key: &str) -> bool {
    key == "/"
        || entries.get(key).is_some_and(|e| e.value.is_none())
        || has_descendants(entries, key)
}

fn leaf_value<'a>(entries: &'a BTreeMap<String, Entry>, key: &str) -> Option<&'a str> {
    entries.get(key).and_then(|e| e.value.as_deref())
}

/// First ancestor of `key` that holds a value
fn leaf_ancestor(entries: &BTreeMap<String, Entry>, key: &str) -> Option<String> {
    let mut current = path::parent(key);
    while current != "/" {
        if leaf_value(entries, &current).is_some() {
            return Some(current);
        }
        current = path::parent(&current);
    }
    None
}

fn build_node(entries: &BTreeMap<String, Entry>, key: &str) -> KvNode {
    if let Some(entry) = entries.get(key)
        && entry.value.is_some()
    {
        return KvNode {
            key: key.to_string(),
            value: entry.value.clone(),
            dir: false,
            children: Vec::new(),
            modified_index: entry.modified_index,
        };
    }

    let prefix = path::descendant_prefix(key);
    let names: BTreeSet<&str> = entries
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .filter_map(|(k, _)| k[prefix.len()..].split('/').next())
        .collect();
    let children = names
        .into_iter()
        .map(|name| build_node(entries, &path::join(key, name)))
        .collect();

    KvNode {
        key: key.to_string(),
        value: None,
        dir: true,
        children,
        modified_index: entries.get(key).map_or(0, |e| e.modified_index),
    }
}

/// Staged changes of one mutation, with an undo log for rollback
struct Batch<'a> {
    entries: &'a mut BTreeMap<String, Entry>,
    index: u64,
    undo: Vec<(String, Option<Entry>)>,
    changes: Vec<Change>,
    events: Vec<WatchEvent>,
}

impl<'a> Batch<'a> {
    fn new(entries: &'a mut BTreeMap<String, Entry>, index: u64) -> Self {
        Self {
            entries,
            index,
            undo: Vec::new(),
            changes: Vec::new(),
            events: Vec::new(),
        }
    }

    fn put(&mut self, key: &str, entry: Entry) {
        let record = entry.expires_at.is_none().then(|| Record {
            value: entry.value.clone(),
            modified_index: entry.modified_index,
        });
        let old = self.entries.insert(key.to_string(), entry);
        self.undo.push((key.to_string(), old));
        self.changes.push((key.to_string(), record));
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let old = self.entries.remove(key)?;
        self.undo.push((key.to_string(), Some(old.clone())));
        self.changes.push((key.to_string(), None));
        Some(old)
    }

    fn emit(&mut self, kind: EventKind, key: &str, value: Option<String>, prev: Option<String>) {
        self.events.push(WatchEvent {
            kind,
            key: key.to_string(),
            value,
            prev_value: prev,
            index: self.index,
        });
    }

    fn current(&self, key: &str) -> Option<&str> {
        leaf_value(self.entries, key)
    }

    fn check(&self, key: &str, expected: Option<&str>) -> StoreResult<()> {
        let current = self.current(key);
        if current == expected && !(expected.is_none() && is_dir(self.entries, key)) {
            return Ok(());
        }
        Err(StoreError::conflict(
            key,
            format!("compare failed: expected {expected:?}, found {current:?}"),
        ))
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        if key == "/" {
            return Err(StoreError::conflict(key, "cannot set root"));
        }
        if let Some(ancestor) = leaf_ancestor(self.entries, key) {
            return Err(StoreError::conflict(
                key,
                format!("ancestor {ancestor} is not a directory"),
            ));
        }
        if is_dir(self.entries, key) {
            return Err(StoreError::conflict(key, "is a directory"));
        }
        let prev = self.current(key).map(str::to_string);
        let kind = if prev.is_some() {
            EventKind::Update
        } else {
            EventKind::Create
        };
        self.put(
            key,
            Entry {
                value: Some(value.to_string()),
                modified_index: self.index,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        self.emit(kind, key, Some(value.to_string()), prev);
        Ok(())
    }

    fn create_dir(&mut self, key: &str) -> StoreResult<()> {
        if let Some(ancestor) = leaf_ancestor(self.entries, key) {
            return Err(StoreError::conflict(
                key,
                format!("ancestor {ancestor} is not a directory"),
            ));
        }
        if self.current(key).is_some() {
            return Err(StoreError::conflict(key, "not a directory"));
        }
        if is_dir(self.entries, key) {
            return Ok(());
        }
        self.put(
            key,
            Entry {
                value: None,
                modified_index: self.index,
                expires_at: None,
            },
        );
        self.emit(EventKind::Create, key, None, None);
        Ok(())
    }

    fn delete(&mut self, key: &str, recursive: bool) -> StoreResult<()> {
        let descendants = has_descendants(self.entries, key);
        if key == "/" {
            return Err(StoreError::conflict(key, "cannot delete root"));
        }
        if !descendants && !self.entries.contains_key(key) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        if descendants && !recursive {
            return Err(StoreError::conflict(key, "directory not empty"));
        }

        let prev = self.remove(key).and_then(|e| e.value);
        if descendants {
            let prefix = path::descendant_prefix(key);
            let doomed: Vec<String> = self
                .entries
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect();
            for k in doomed {
                self.remove(&k);
            }
        }
        self.emit(EventKind::Delete, key, None, prev);
        Ok(())
    }

    fn apply(&mut self, op: &TxnOp) -> StoreResult<()> {
        match op {
            TxnOp::Check { key, expected } => self.check(&path::normalize(key), expected.as_deref()),
            TxnOp::Set { key, value } => self.set(&path::normalize(key), value, None),
            TxnOp::Delete { key, recursive } => self.delete(&path::normalize(key), *recursive),
        }
    }

    fn rollback(self) {
        for (key, old) in self.undo.into_iter().rev() {
            match old {
                Some(entry) => {
                    self.entries.insert(key, entry);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
    }

    fn finish(self) -> Vec<WatchEvent> {
        self.events
    }
}

fn watch_matches(event: &WatchEvent, key: &str, recursive: bool) -> bool {
    if event.key == key {
        return true;
    }
    if recursive && path::is_within(&event.key, key) {
        return true;
    }
    // Deleting an ancestor removes the watched key too
    event.kind == EventKind::Delete && path::is_within(key, &event.key)
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<String> {
        let key = path::normalize(key);
        self.read(|inner| {
            if let Some(value) = leaf_value(&inner.entries, &key) {
                return Ok(value.to_string());
            }
            if is_dir(&inner.entries, &key) {
                return Err(StoreError::conflict(key.clone(), "is a directory"));
            }
            Err(StoreError::NotFound(key.clone()))
        })
    }

    async fn get_recursive(&self, key: &str) -> StoreResult<KvNode> {
        let key = path::normalize(key);
        self.read(|inner| {
            if !inner.entries.contains_key(&key) && !is_dir(&inner.entries, &key) {
                return Err(StoreError::NotFound(key.clone()));
            }
            Ok(build_node(&inner.entries, &key))
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<u64> {
        let key = path::normalize(key);
        self.mutate(|batch| batch.set(&key, value, ttl))
    }

    async fn create_dir(&self, key: &str) -> StoreResult<()> {
        let key = path::normalize(key);
        self.mutate(|batch| batch.create_dir(&key)).map(|_| ())
    }

    async fn delete(&self, key: &str, recursive: bool) -> StoreResult<()> {
        let key = path::normalize(key);
        self.mutate(|batch| batch.delete(&key, recursive)).map(|_| ())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<u64> {
        let key = path::normalize(key);
        self.mutate(|batch| {
            batch.check(&key, expected)?;
            batch.set(&key, value, ttl)
        })
    }

    async fn transaction(&self, ops: Vec<TxnOp>) -> StoreResult<u64> {
        self.mutate(|batch| ops.iter().try_for_each(|op| batch.apply(op)))
    }

    async fn watch(
        &self,
        key: &str,
        recursive: bool,
        after_index: Option<u64>,
    ) -> StoreResult<Watcher> {
        let key = path::normalize(key);
        let (start, replay, mut rx) = {
            let mut inner = self.inner.lock();
            self.purge_expired(&mut inner);
            let start = after_index.unwrap_or(inner.index);
            if start < inner.history_floor {
                return Err(StoreError::Unavailable(format!(
                    "index {start} has been cleared (oldest retained {})",
                    inner.history_floor + 1
                )));
            }
            let replay: Vec<WatchEvent> = inner
                .history
                .iter()
                .filter(|e| e.index > start && watch_matches(e, &key, recursive))
                .cloned()
                .collect();
            (start, replay, self.events.subscribe())
        };

        let (tx, events_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let task = tokio::spawn(async move {
            let mut delivered = start;
            for event in replay {
                delivered = event.index;
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.index <= delivered || !watch_matches(&event, &key, recursive) {
                            continue;
                        }
                        delivered = event.index;
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        let _ = tx
                            .send(Err(StoreError::Unavailable(format!(
                                "watch on {key} fell behind by {n} events"
                            ))))
                            .await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Watcher::new(events_rx, start, Some(task)))
    }

    async fn current_index(&self) -> StoreResult<u64> {
        self.read(|inner| Ok(inner.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_and_tree() {
        let store = MemoryStore::new();
        store.set("/c/mon/a/id", "mon0", None).await.unwrap();
        store.set("/c/mon/a/port", "6790", None).await.unwrap();
        store.set("/c/mon/b/id", "mon1", None).await.unwrap();

        assert_eq!(store.get("/c/mon/a/id").await.unwrap(), "mon0");
        assert!(store.get("/c/mon/z").await.unwrap_err().is_not_found());

        let tree = store.get_recursive("/c/mon").await.unwrap();
        assert!(tree.dir);
        assert_eq!(tree.child_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(tree.descend("a/port").unwrap().value.as_deref(), Some("6790"));

        // Parents are visible without an explicit directory entry
        assert!(store.get("/c").await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_empty_dir_and_delete() {
        let store = MemoryStore::new();
        store.create_dir("/c/empty").await.unwrap();
        store.create_dir("/c/empty").await.unwrap();
        let node = store.get_recursive("/c/empty").await.unwrap();
        assert!(node.dir && node.children.is_empty());

        store.set("/c/full/x", "1", None).await.unwrap();
        assert!(store.delete("/c/full", false).await.unwrap_err().is_conflict());
        store.delete("/c/full", true).await.unwrap();
        assert!(store.get_recursive("/c/full").await.unwrap_err().is_not_found());
        assert!(store.delete("/c/full", true).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_leaf_dir_conflicts() {
        let store = MemoryStore::new();
        store.set("/a/b", "leaf", None).await.unwrap();
        assert!(store.set("/a/b/c", "x", None).await.unwrap_err().is_conflict());
        assert!(store.set("/a", "x", None).await.unwrap_err().is_conflict());
        assert!(store.create_dir("/a/b").await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        store.compare_and_swap("/lease", None, "n1", None).await.unwrap();
        let err = store
            .compare_and_swap("/lease", None, "n2", None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        store
            .compare_and_swap("/lease", Some("n1"), "n1", None)
            .await
            .unwrap();
        assert!(
            store
                .compare_and_swap("/lease", Some("n2"), "n2", None)
                .await
                .unwrap_err()
                .is_conflict()
        );
        assert_eq!(store.get("/lease").await.unwrap(), "n1");
    }

    #[tokio::test]
    async fn test_transaction_is_atomic() {
        let store = MemoryStore::new();
        store.set("/m/desired/a/id", "mon0", None).await.unwrap();
        let before = store.current_index().await.unwrap();

        let err = store
            .transaction(vec![
                TxnOp::set("/m/applied/a/id", "mon0"),
                TxnOp::delete_tree("/m/desired/a"),
                TxnOp::check("/m/desired/a/id", Some("mon0".to_string())),
            ])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.current_index().await.unwrap(), before);
        assert_eq!(store.get("/m/desired/a/id").await.unwrap(), "mon0");
        assert!(store.get("/m/applied/a/id").await.unwrap_err().is_not_found());

        let index = store
            .transaction(vec![
                TxnOp::check("/m/desired/a/id", Some("mon0".to_string())),
                TxnOp::set("/m/applied/a/id", "mon0"),
                TxnOp::delete_tree("/m/desired/a"),
            ])
            .await
            .unwrap();
        assert_eq!(index, before + 1);
        assert_eq!(store.get("/m/applied/a/id").await.unwrap(), "mon0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_emits_event() {
        let store = MemoryStore::new();
        let mut watcher = store.watch("/hb", true, None).await.unwrap();
        store
            .set("/hb/n1", "alive", Some(Duration::from_secs(5)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("/hb/n1").await.unwrap_err().is_not_found());

        let created = watcher.next().await.unwrap().unwrap();
        assert_eq!(created.kind, EventKind::Create);
        let expired = watcher.next().await.unwrap().unwrap();
        assert_eq!(expired.kind, EventKind::Expire);
        assert_eq!(expired.prev_value.as_deref(), Some("alive"));
    }

    #[tokio::test]
    async fn test_watch_resume_misses_nothing() {
        let store = MemoryStore::new();
        let mut watcher = store.watch("/notify/n1", true, None).await.unwrap();
        store.set("/notify/n1/mon/status", "trigger", None).await.unwrap();
        let first = watcher.next().await.unwrap().unwrap();
        let resume_at = watcher.last_index();
        assert_eq!(first.index, resume_at);
        drop(watcher);

        // Changes while disconnected
        store.set("/notify/n2/mon/status", "trigger", None).await.unwrap();
        store.set("/notify/n1/mon/status", "succeeded", None).await.unwrap();

        let mut watcher = store
            .watch("/notify/n1", true, Some(resume_at))
            .await
            .unwrap();
        let event = watcher.next().await.unwrap().unwrap();
        assert_eq!(event.value.as_deref(), Some("succeeded"));
        assert_eq!(event.kind, EventKind::Update);
    }

    #[tokio::test]
    async fn test_watch_sees_ancestor_delete() {
        let store = MemoryStore::new();
        store.set("/svc/a/b", "1", None).await.unwrap();
        let mut watcher = store.watch("/svc/a/b", false, None).await.unwrap();
        store.delete("/svc", true).await.unwrap();
        let event = watcher.next().await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.key, "/svc");
    }

    #[tokio::test]
    async fn test_watch_cleared_index() {
        let store = MemoryStore::new();
        for i in 0..(HISTORY_LIMIT + 10) {
            store.set("/k", &i.to_string(), None).await.unwrap();
        }
        let err = store.watch("/k", false, Some(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.redb");
        {
            let store = MemoryStore::open(&path).unwrap();
            store.set("/c/fsid", "abc", None).await.unwrap();
            store.set("/c/tmp", "gone", Some(Duration::from_secs(60))).await.unwrap();
            store.create_dir("/c/empty").await.unwrap();
            store.set("/c/old/x", "1", None).await.unwrap();
            store.delete("/c/old", true).await.unwrap();
        }
        let store = MemoryStore::open(&path).unwrap();
        assert_eq!(store.get("/c/fsid").await.unwrap(), "abc");
        assert!(store.get("/c/tmp").await.unwrap_err().is_not_found());
        assert!(store.get_recursive("/c/empty").await.unwrap().dir);
        assert!(store.get_recursive("/c/old").await.unwrap_err().is_not_found());
        assert_eq!(store.current_index().await.unwrap(), 5);
    }
}
