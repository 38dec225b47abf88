//! Persistent log of successful deletions
//!
//! Uses one sled tree per packet type. Records are bincode-encoded
//! [`DeletionRecord`]s keyed by the raw 32-byte DHT key.

use courier_core::{DeletionRecord, DhtKey, StorableType, Timestamp};
use sled::{Db, Tree};
use tracing::debug;

use crate::error::Result;

/// Deletion records for one packet type
#[derive(Clone, Debug)]
pub struct DeletionLog {
    tree: Tree,
}

impl DeletionLog {
    /// Open the log for `storable` inside `db`
    pub fn open(db: &Db, storable: StorableType) -> Result<Self> {
        let tree = db.open_tree(format!("deleted_{}", storable.folder_name()))?;
        Ok(Self { tree })
    }

    /// Append a record, replacing an older record for the same key
    pub fn record(&self, record: &DeletionRecord) -> Result<()> {
        let value = bincode::serialize(record)?;
        self.tree.insert(record.key.as_bytes(), value)?;
        debug!("Recorded deletion of {}", record.key);
        Ok(())
    }

    /// Record for `key`
    pub fn get(&self, key: &DhtKey) -> Result<Option<DeletionRecord>> {
        match self.tree.get(key.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Whether `key` was deleted
    pub fn contains(&self, key: &DhtKey) -> Result<bool> {
        Ok(self.tree.contains_key(key.as_bytes())?)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Drop records older than `cutoff`. Returns the number dropped.
    pub fn purge_older_than(&self, cutoff: Timestamp) -> Result<usize> {
        let mut purged = 0;
        for item in self.tree.iter() {
            let (key, value) = item?;
            let stale = match bincode::deserialize::<DeletionRecord>(&value) {
                Ok(record) => record.store_time < cutoff,
                Err(_) => true,
            };
            if stale {
                self.tree.remove(key)?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}
