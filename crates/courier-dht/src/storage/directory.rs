//! Signed directory entry storage

use std::path::Path;
use std::time::Duration;

use courier_core::{DeletionRecord, DhtKey, DhtStorablePacket, StorableType, Timestamp};
use tracing::{debug, warn};

use super::{DeleteRequest, DhtStorageHandler, PacketFolder, StoreOutcome};
use crate::error::Result;

/// Stores [`DirectoryEntry`](courier_core::DirectoryEntry) packets.
///
/// Entries are accepted only with a valid signature and are never
/// overwritten, so the first registration of a name wins.
pub struct DirectoryEntryFolder {
    folder: PacketFolder,
}

impl DirectoryEntryFolder {
    /// Open the folder at `dir`
    pub fn open(dir: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        Ok(Self {
            folder: PacketFolder::open(dir, max_bytes)?,
        })
    }
}

impl DhtStorageHandler for DirectoryEntryFolder {
    fn packet_type(&self) -> StorableType {
        StorableType::DirectoryEntry
    }

    fn store(&self, packet: &DhtStorablePacket) -> Result<StoreOutcome> {
        let DhtStorablePacket::DirectoryEntry(entry) = packet else {
            return Ok(StoreOutcome::Rejected);
        };
        if !entry.verify() {
            warn!("Rejecting directory entry {} with bad signature", entry.name());
            return Ok(StoreOutcome::Rejected);
        }
        let key = entry.key();
        if self.folder.contains(&key) {
            return Ok(StoreOutcome::Duplicate);
        }
        self.folder.write(&key, &packet.encode()?)?;
        debug!("Stored directory entry {}", entry.name());
        Ok(StoreOutcome::Stored)
    }

    fn retrieve(&self, key: &DhtKey) -> Result<Option<DhtStorablePacket>> {
        self.folder.load(key)
    }

    fn individual_packets(&self) -> Result<Vec<DhtStorablePacket>> {
        self.folder.packets()
    }

    fn process_delete(&self, _request: DeleteRequest<'_>) -> Result<bool> {
        Ok(false)
    }

    fn deletion_records(&self, _key: &DhtKey) -> Result<Vec<DeletionRecord>> {
        Ok(Vec::new())
    }

    fn delete_expired(&self, max_age: Duration, now: Timestamp) -> Result<usize> {
        self.folder.delete_older_than(now.minus(max_age))
    }
}
