//! Index packet storage
//!
//! One index per recipient destination. Incoming index packets for a
//! destination already stored are merged into the stored packet instead of
//! being rejected as duplicates.

use std::path::Path;
use std::time::Duration;

use courier_core::{
    DeletionRecord, DhtKey, DhtStorablePacket, IndexPacket, StorableType, Timestamp,
};
use parking_lot::Mutex;
use tracing::debug;

use super::{DeleteRequest, DeletionLog, DhtStorageHandler, PacketFolder, StoreOutcome};
use crate::error::Result;

/// Stores [`IndexPacket`]s keyed by destination hash
pub struct IndexPacketFolder {
    folder: PacketFolder,
    deletions: DeletionLog,
    // serializes read-modify-write of index files
    write_lock: Mutex<()>,
}

impl IndexPacketFolder {
    /// Open the folder at `dir`
    pub fn open(dir: impl AsRef<Path>, deletions: DeletionLog, max_bytes: u64) -> Result<Self> {
        Ok(Self {
            folder: PacketFolder::open(dir, max_bytes)?,
            deletions,
            write_lock: Mutex::new(()),
        })
    }

    fn load_index(&self, key: &DhtKey) -> Result<Option<IndexPacket>> {
        match self.folder.load(key)? {
            Some(DhtStorablePacket::Index(index)) => Ok(Some(index)),
            Some(_) => {
                self.folder.delete(key)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn save_index(&self, index: &IndexPacket) -> Result<()> {
        let key = index.destination_hash();
        if index.is_empty() {
            self.folder.delete(&key)?;
            return Ok(());
        }
        let bytes = DhtStorablePacket::Index(index.clone()).encode()?;
        self.folder.write(&key, &bytes)
    }
}

impl DhtStorageHandler for IndexPacketFolder {
    fn packet_type(&self) -> StorableType {
        StorableType::Index
    }

    fn store(&self, packet: &DhtStorablePacket) -> Result<StoreOutcome> {
        let DhtStorablePacket::Index(incoming) = packet else {
            return Ok(StoreOutcome::Rejected);
        };

        // entries deleted earlier must not come back through replication
        let mut fresh = IndexPacket::new(incoming.destination_hash());
        for entry in incoming.entries() {
            if !self.deletions.contains(&entry.email_key)? {
                fresh.add_entry(entry.clone());
            }
        }
        if fresh.is_empty() {
            return Ok(StoreOutcome::Rejected);
        }

        let _guard = self.write_lock.lock();
        let key = fresh.destination_hash();
        let (merged, added) = match self.load_index(&key)? {
            Some(mut stored) => {
                let added = stored.merge(&fresh);
                (stored, added)
            }
            None => {
                let added = fresh.entries().len();
                (fresh, added)
            }
        };
        if added == 0 {
            return Ok(StoreOutcome::Duplicate);
        }

        self.save_index(&merged)?;
        debug!("Stored {} index entries for {}", added, key);
        Ok(StoreOutcome::Stored)
    }

    fn retrieve(&self, key: &DhtKey) -> Result<Option<DhtStorablePacket>> {
        Ok(self.load_index(key)?.map(DhtStorablePacket::Index))
    }

    fn individual_packets(&self) -> Result<Vec<DhtStorablePacket>> {
        self.folder.packets()
    }

    fn process_delete(&self, request: DeleteRequest<'_>) -> Result<bool> {
        let DeleteRequest::Index(request) = request else {
            return Ok(false);
        };

        let _guard = self.write_lock.lock();
        let Some(mut index) = self.load_index(&request.destination_hash)? else {
            return Ok(false);
        };

        let now = Timestamp::now();
        let mut removed = 0;
        for delete in &request.entries {
            let authorized = index
                .entry(&delete.email_key)
                .is_some_and(|entry| delete.authorization.matches(&entry.delete_verification_hash));
            if !authorized {
                continue;
            }
            index.remove_entry(&delete.email_key);
            self.deletions.record(&DeletionRecord {
                key: delete.email_key,
                authorization: delete.authorization.clone(),
                store_time: now,
            })?;
            removed += 1;
        }

        if removed > 0 {
            self.save_index(&index)?;
            debug!(
                "Deleted {} index entries for {}",
                removed, request.destination_hash
            );
        }
        Ok(removed > 0)
    }

    fn deletion_records(&self, key: &DhtKey) -> Result<Vec<DeletionRecord>> {
        Ok(self.deletions.get(key)?.into_iter().collect())
    }

    fn delete_expired(&self, max_age: Duration, now: Timestamp) -> Result<usize> {
        let cutoff = now.minus(max_age);
        self.deletions.purge_older_than(cutoff)?;

        let _guard = self.write_lock.lock();
        let mut removed = 0;
        for packet in self.folder.packets()? {
            let DhtStorablePacket::Index(mut index) = packet else {
                continue;
            };
            let expired = index.retain_newer_than(cutoff);
            if expired > 0 {
                self.save_index(&index)?;
                removed += expired;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Hash256, IndexDeleteEntry, IndexDeleteRequest, IndexEntry};
    use courier_crypto::DeleteAuthorization;
    use tempfile::tempdir;

    fn open(dir: &Path) -> IndexPacketFolder {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let log = DeletionLog::open(&db, StorableType::Index).unwrap();
        IndexPacketFolder::open(dir, log, u64::MAX).unwrap()
    }

    fn entry(auth: &DeleteAuthorization, secs: i64) -> IndexEntry {
        IndexEntry {
            email_key: Hash256::random(),
            delete_verification_hash: auth.verification_hash(),
            store_time: Timestamp::from_secs(secs),
        }
    }

    fn index_of(dest: Hash256, entries: Vec<IndexEntry>) -> DhtStorablePacket {
        IndexPacket::with_entries(dest, entries).into()
    }

    fn stored_entries(folder: &IndexPacketFolder, dest: &Hash256) -> usize {
        match folder.retrieve(dest).unwrap() {
            Some(DhtStorablePacket::Index(index)) => index.entries().len(),
            _ => 0,
        }
    }

    #[test]
    fn test_store_merges_entries() {
        let dir = tempdir().unwrap();
        let folder = open(dir.path());
        let dest = Hash256::random();
        let auth = DeleteAuthorization::generate();
        let first = entry(&auth, 10);
        let second = entry(&auth, 20);

        let packet = index_of(dest, vec![first.clone()]);
        assert_eq!(folder.store(&packet).unwrap(), StoreOutcome::Stored);
        assert_eq!(folder.store(&packet).unwrap(), StoreOutcome::Duplicate);
        assert_eq!(
            folder.store(&index_of(dest, vec![first, second])).unwrap(),
            StoreOutcome::Stored
        );
        assert_eq!(stored_entries(&folder, &dest), 2);
    }

    #[test]
    fn test_empty_index_rejected() {
        let dir = tempdir().unwrap();
        let folder = open(dir.path());
        let packet = index_of(Hash256::random(), vec![]);
        assert_eq!(folder.store(&packet).unwrap(), StoreOutcome::Rejected);
    }

    #[test]
    fn test_delete_entries() {
        let dir = tempdir().unwrap();
        let folder = open(dir.path());
        let dest = Hash256::random();
        let auth = DeleteAuthorization::generate();
        let keep = entry(&DeleteAuthorization::generate(), 10);
        let drop = entry(&auth, 10);
        folder
            .store(&index_of(dest, vec![keep.clone(), drop.clone()]))
            .unwrap();

        let request = IndexDeleteRequest {
            destination_hash: dest,
            entries: vec![
                IndexDeleteEntry {
                    email_key: drop.email_key,
                    authorization: auth.clone(),
                },
                IndexDeleteEntry {
                    email_key: keep.email_key,
                    authorization: auth.clone(),
                },
            ],
        };
        assert!(folder.process_delete(DeleteRequest::Index(&request)).unwrap());
        assert_eq!(stored_entries(&folder, &dest), 1);
        assert_eq!(folder.deletion_records(&drop.email_key).unwrap().len(), 1);
        assert!(folder.deletion_records(&keep.email_key).unwrap().is_empty());

        // a deleted entry is not merged back in
        let replay = index_of(dest, vec![drop]);
        assert_eq!(folder.store(&replay).unwrap(), StoreOutcome::Rejected);
    }

    #[test]
    fn test_last_entry_deleted_removes_file() {
        let dir = tempdir().unwrap();
        let folder = open(dir.path());
        let dest = Hash256::random();
        let auth = DeleteAuthorization::generate();
        let only = entry(&auth, 10);
        folder.store(&index_of(dest, vec![only.clone()])).unwrap();

        let request = IndexDeleteRequest {
            destination_hash: dest,
            entries: vec![IndexDeleteEntry {
                email_key: only.email_key,
                authorization: auth,
            }],
        };
        assert!(folder.process_delete(DeleteRequest::Index(&request)).unwrap());
        assert_eq!(folder.retrieve(&dest).unwrap(), None);
    }

    #[test]
    fn test_delete_expired_entries() {
        let dir = tempdir().unwrap();
        let folder = open(dir.path());
        let dest = Hash256::random();
        let auth = DeleteAuthorization::generate();
        folder
            .store(&index_of(dest, vec![entry(&auth, 10), entry(&auth, 1_000)]))
            .unwrap();

        let now = Timestamp::from_secs(1_100);
        let removed = folder
            .delete_expired(Duration::from_secs(500), now)
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(stored_entries(&folder, &dest), 1);
    }
}
