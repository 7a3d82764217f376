//! Store contract shared by all backends

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Error type for coordination store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("conflict on {key}: {reason}")]
    Conflict { key: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store transport error: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn conflict(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<StoreError> for castle_common::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => Self::NotFound(key),
            StoreError::Conflict { key, reason } => Self::Conflict(format!("{key}: {reason}")),
            StoreError::Unavailable(msg) | StoreError::Transport(msg) => Self::Unavailable(msg),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A node of the key tree returned by recursive reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvNode {
    /// Full key of this node
    pub key: String,
    /// Value for leaves, `None` for directories
    pub value: Option<String>,
    /// True for directories (explicit or implied by descendants)
    pub dir: bool,
    /// Children sorted by key
    pub children: Vec<KvNode>,
    /// Store index of the last modification (0 for implied directories)
    pub modified_index: u64,
}

impl KvNode {
    /// Last path segment of this node's key
    #[must_use]
    pub fn name(&self) -> &str {
        crate::path::leaf(&self.key)
    }

    /// Direct child by name
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|c| c.name() == name)
    }

    /// Value of a direct leaf child
    #[must_use]
    pub fn child_value(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(|c| c.value.as_deref())
    }

    /// Names of the direct children
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(Self::name)
    }

    /// Descend through a relative path (`"a/b"`)
    #[must_use]
    pub fn descend(&self, rel: &str) -> Option<&Self> {
        rel.split('/')
            .filter(|p| !p.is_empty())
            .try_fold(self, |node, part| node.child(part))
    }
}

/// Kind of change observed by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
    /// A TTL key lapsed
    Expire,
}

/// A change to a watched key or subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: Option<String>,
    pub prev_value: Option<String>,
    /// Store index of the change; resume with `after_index = index`
    pub index: u64,
}

/// A single operation of an atomic transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Fail the transaction unless the key holds `expected` (`None` = absent)
    Check {
        key: String,
        expected: Option<String>,
    },
    Set {
        key: String,
        value: String,
    },
    Delete {
        key: String,
        recursive: bool,
    },
}

impl TxnOp {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete_tree(key: impl Into<String>) -> Self {
        Self::Delete {
            key: key.into(),
            recursive: true,
        }
    }

    pub fn check(key: impl Into<String>, expected: Option<String>) -> Self {
        Self::Check {
            key: key.into(),
            expected,
        }
    }
}

/// Stream of watch events
///
/// Tracks the index of the last delivered event so a broken watch can be
/// re-established with `watch(key, recursive, Some(watcher.last_index()))`
/// without missing changes.
#[derive(Debug)]
pub struct Watcher {
    rx: mpsc::Receiver<StoreResult<WatchEvent>>,
    last_index: u64,
    task: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Create a watcher fed by `rx`; `task` is aborted when the watcher drops
    #[must_use]
    pub const fn new(
        rx: mpsc::Receiver<StoreResult<WatchEvent>>,
        start_index: u64,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            rx,
            last_index: start_index,
            task,
        }
    }

    /// Next event, or `None` once the watch has ended
    pub async fn next(&mut self) -> Option<StoreResult<WatchEvent>> {
        let item = self.rx.recv().await?;
        if let Ok(event) = &item {
            self.last_index = self.last_index.max(event.index);
        }
        Some(item)
    }

    /// Index of the last delivered event (or the index the watch started at)
    #[must_use]
    pub const fn last_index(&self) -> u64 {
        self.last_index
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Hierarchical key-value store with watches, TTLs and compare-and-swap
///
/// Readers must treat `NotFound` on a non-terminal path as "not yet
/// initialized". Parent directories are never created implicitly as
/// entries; `create_dir` is the only way to make an empty directory.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a leaf value
    async fn get(&self, key: &str) -> StoreResult<String>;

    /// Read a key and all of its descendants
    async fn get_recursive(&self, key: &str) -> StoreResult<KvNode>;

    /// Write a leaf value, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<u64>;

    /// Create an (empty) directory; succeeds if it already exists
    async fn create_dir(&self, key: &str) -> StoreResult<()>;

    /// Delete a leaf, or a directory (non-empty only when `recursive`)
    async fn delete(&self, key: &str, recursive: bool) -> StoreResult<()>;

    /// Write `value` only if the key currently holds `expected`.
    /// `expected = None` means the key must not exist.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<u64>;

    /// Apply all operations or none
    async fn transaction(&self, ops: Vec<TxnOp>) -> StoreResult<u64>;

    /// Watch a key (or subtree) for changes with index greater than
    /// `after_index`; `None` starts from the current index
    async fn watch(
        &self,
        key: &str,
        recursive: bool,
        after_index: Option<u64>,
    ) -> StoreResult<Watcher>;

    /// Index of the most recent change
    async fn current_index(&self) -> StoreResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(key: &str, value: &str) -> KvNode {
        KvNode {
            key: key.to_string(),
            value: Some(value.to_string()),
            ..KvNode::default()
        }
    }

    #[test]
    fn test_node_navigation() {
        let node = KvNode {
            key: "/m".to_string(),
            dir: true,
            children: vec![KvNode {
                key: "/m/a".to_string(),
                dir: true,
                children: vec![leaf("/m/a/id", "mon0"), leaf("/m/a/port", "6790")],
                ..KvNode::default()
            }],
            ..KvNode::default()
        };
        assert_eq!(node.child_names().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(node.descend("a/id").unwrap().value.as_deref(), Some("mon0"));
        assert_eq!(node.child("a").unwrap().child_value("port"), Some("6790"));
        assert!(node.descend("b/id").is_none());
    }

    #[test]
    fn test_error_conversion() {
        let err: castle_common::Error = StoreError::Transport("refused".into()).into();
        assert!(err.is_unavailable());
        let err: castle_common::Error = StoreError::NotFound("/k".into()).into();
        assert!(err.is_not_found());
    }
}
