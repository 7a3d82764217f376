//! redb write-through for the local store backend

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const META: TableDefinition<&str, u64> = TableDefinition::new("kv_meta");
const META_INDEX: &str = "index";

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for PersistError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Durable form of a store entry. TTL keys are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// `None` marks an explicit directory
    pub value: Option<String>,
    pub modified_index: u64,
}

/// A pending change: `Some` upserts, `None` removes
pub type Change = (String, Option<Record>);

pub struct Persist {
    db: Database,
}

impl Persist {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(ENTRIES)?;
            let _t = write_txn.open_table(META)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Load all records and the last committed index
    pub fn load(&self) -> PersistResult<(Vec<(String, Record)>, u64)> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            match bincode::deserialize::<Record>(entry.1.value()) {
                Ok(record) => records.push((key, record)),
                Err(e) => tracing::error!("Failed to decode store entry '{}': {}", key, e),
            }
        }
        let meta = read_txn.open_table(META)?;
        let index = meta.get(META_INDEX)?.map_or(0, |v| v.value());
        Ok((records, index))
    }

    /// Apply a batch of changes atomically and record the new index
    pub fn commit(&self, changes: &[Change], index: u64) -> PersistResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENTRIES)?;
            for (key, record) in changes {
                match record {
                    Some(record) => {
                        let bytes = bincode::serialize(record)?;
                        table.insert(key.as_str(), bytes.as_slice())?;
                    }
                    None => {
                        table.remove(key.as_str())?;
                    }
                }
            }
            let mut meta = write_txn.open_table(META)?;
            meta.insert(META_INDEX, index)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.redb");
        {
            let persist = Persist::open(&path).unwrap();
            let changes = vec![
                (
                    "/a".to_string(),
                    Some(Record {
                        value: Some("1".to_string()),
                        modified_index: 1,
                    }),
                ),
                (
                    "/d".to_string(),
                    Some(Record {
                        value: None,
                        modified_index: 2,
                    }),
                ),
            ];
            persist.commit(&changes, 2).unwrap();
            persist.commit(&[("/d".to_string(), None)], 3).unwrap();
        }
        let persist = Persist::open(&path).unwrap();
        let (records, index) = persist.load().unwrap();
        assert_eq!(index, 3);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "/a");
        assert_eq!(records[0].1.value.as_deref(), Some("1"));
    }
}
