//! Castle KV - Coordination store adapter
//!
//! A strongly consistent hierarchical key-value store holds desired state,
//! applied state and cluster secrets. This crate exposes it through the
//! [`KvStore`] trait with two backends:
//!
//! - [`MemoryStore`]: process-local, optionally persisted to redb
//! - [`EtcdStore`]: the etcd v2 keys API over HTTP
//!
//! plus path helpers and a few convenience operations in [`util`].

pub mod etcd;
pub mod memory;
pub mod path;
mod persist;
pub mod store;
pub mod util;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use store::{
    EventKind, KvNode, KvStore, StoreError, StoreResult, TxnOp, WatchEvent, Watcher,
};
