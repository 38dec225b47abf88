//! Encrypted email packet storage

use std::path::Path;
use std::time::Duration;

use courier_core::{DeletionRecord, DhtKey, DhtStorablePacket, StorableType, Timestamp};
use tracing::debug;

use super::{DeleteRequest, DeletionLog, DhtStorageHandler, PacketFolder, StoreOutcome};
use crate::error::Result;

/// Stores [`EncryptedEmailPacket`](courier_core::EncryptedEmailPacket)s and
/// deletes them on presentation of the matching delete authorization
pub struct EmailPacketFolder {
    folder: PacketFolder,
    deletions: DeletionLog,
}

impl EmailPacketFolder {
    /// Open the folder at `dir`
    pub fn open(dir: impl AsRef<Path>, deletions: DeletionLog, max_bytes: u64) -> Result<Self> {
        Ok(Self {
            folder: PacketFolder::open(dir, max_bytes)?,
            deletions,
        })
    }
}

impl DhtStorageHandler for EmailPacketFolder {
    fn packet_type(&self) -> StorableType {
        StorableType::EncryptedEmail
    }

    fn store(&self, packet: &DhtStorablePacket) -> Result<StoreOutcome> {
        let DhtStorablePacket::EncryptedEmail(email) = packet else {
            return Ok(StoreOutcome::Rejected);
        };
        let key = email.key();
        if self.deletions.contains(&key)? {
            debug!("Refusing to store deleted email packet {}", key);
            return Ok(StoreOutcome::Rejected);
        }
        if self.folder.contains(&key) {
            return Ok(StoreOutcome::Duplicate);
        }
        self.folder.write(&key, &packet.encode()?)?;
        debug!("Stored email packet {}", key);
        Ok(StoreOutcome::Stored)
    }

    fn retrieve(&self, key: &DhtKey) -> Result<Option<DhtStorablePacket>> {
        self.folder.load(key)
    }

    fn individual_packets(&self) -> Result<Vec<DhtStorablePacket>> {
        self.folder.packets()
    }

    fn process_delete(&self, request: DeleteRequest<'_>) -> Result<bool> {
        let DeleteRequest::Email(request) = request else {
            return Ok(false);
        };
        let Some(DhtStorablePacket::EncryptedEmail(email)) = self.folder.load(&request.key)? else {
            return Ok(false);
        };
        if !email.is_delete_authorized(&request.authorization) {
            debug!("Delete authorization mismatch for {}", request.key);
            return Ok(false);
        }

        self.folder.delete(&request.key)?;
        self.deletions.record(&DeletionRecord {
            key: request.key,
            authorization: request.authorization.clone(),
            store_time: Timestamp::now(),
        })?;
        debug!("Deleted email packet {}", request.key);
        Ok(true)
    }

    fn deletion_records(&self, key: &DhtKey) -> Result<Vec<DeletionRecord>> {
        Ok(self.deletions.get(key)?.into_iter().collect())
    }

    fn delete_expired(&self, max_age: Duration, now: Timestamp) -> Result<usize> {
        let cutoff = now.minus(max_age);
        self.deletions.purge_older_than(cutoff)?;
        self.folder.delete_older_than(cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{EmailDeleteRequest, EncryptedEmailPacket, Hash256};
    use courier_crypto::DeleteAuthorization;
    use tempfile::tempdir;

    fn open(dir: &Path) -> EmailPacketFolder {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let log = DeletionLog::open(&db, StorableType::EncryptedEmail).unwrap();
        EmailPacketFolder::open(dir, log, u64::MAX).unwrap()
    }

    fn email(auth: &DeleteAuthorization) -> DhtStorablePacket {
        EncryptedEmailPacket::new(auth.verification_hash(), 1, b"secret words".to_vec())
            .unwrap()
            .into()
    }

    #[test]
    fn test_store_then_retrieve() {
        let dir = tempdir().unwrap();
        let folder = open(dir.path());
        let packet = email(&DeleteAuthorization::generate());
        assert_eq!(folder.store(&packet).unwrap(), StoreOutcome::Stored);
        assert_eq!(folder.retrieve(&packet.key()).unwrap(), Some(packet.clone()));
        assert_eq!(folder.retrieve(&Hash256::random()).unwrap(), None);
        assert_eq!(folder.individual_packets().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_not_overwritten() {
        let dir = tempdir().unwrap();
        let folder = open(dir.path());
        let packet = email(&DeleteAuthorization::generate());
        folder.store(&packet).unwrap();
        assert_eq!(folder.store(&packet).unwrap(), StoreOutcome::Duplicate);
    }

    #[test]
    fn test_delete_with_correct_token() {
        let dir = tempdir().unwrap();
        let folder = open(dir.path());
        let auth = DeleteAuthorization::generate();
        let packet = email(&auth);
        folder.store(&packet).unwrap();

        let request = EmailDeleteRequest {
            key: packet.key(),
            authorization: auth.clone(),
        };
        assert!(folder.process_delete(DeleteRequest::Email(&request)).unwrap());
        assert_eq!(folder.retrieve(&packet.key()).unwrap(), None);

        let records = folder.deletion_records(&packet.key()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].authorization, auth);

        // a stale replica is not resurrected
        assert_eq!(folder.store(&packet).unwrap(), StoreOutcome::Rejected);
    }

    #[test]
    fn test_delete_with_wrong_token_is_noop() {
        let dir = tempdir().unwrap();
        let folder = open(dir.path());
        let packet = email(&DeleteAuthorization::generate());
        folder.store(&packet).unwrap();

        let request = EmailDeleteRequest {
            key: packet.key(),
            authorization: DeleteAuthorization::generate(),
        };
        assert!(!folder.process_delete(DeleteRequest::Email(&request)).unwrap());
        assert_eq!(folder.retrieve(&packet.key()).unwrap(), Some(packet.clone()));
        assert!(folder.deletion_records(&packet.key()).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let dir = tempdir().unwrap();
        let folder = open(dir.path());
        let index: DhtStorablePacket = courier_core::IndexPacket::new(Hash256::random()).into();
        assert_eq!(folder.store(&index).unwrap(), StoreOutcome::Rejected);
    }
}
