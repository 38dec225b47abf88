//! Local, content-addressed packet storage
//!
//! Each storable packet type has its own [`DhtStorageHandler`] backed by a
//! [`PacketFolder`] under the storage root:
//!
//! ```text
//! <storage_path>/
//!   email/<base64url(key)>.pkt
//!   index/<base64url(key)>.pkt
//!   directory/<base64url(key)>.pkt
//!   deletions/            sled database with the deletion logs
//! ```
//!
//! Local storage is a best-effort cache: corrupt files are deleted, and a
//! failed store is reported to the requesting peer, never retried.

mod deletion;
mod directory;
mod email;
mod folder;
mod index;

pub use deletion::DeletionLog;
pub use directory::DirectoryEntryFolder;
pub use email::EmailPacketFolder;
pub use folder::{PacketFolder, PACKET_EXTENSION};
pub use index::IndexPacketFolder;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{
    DeletionRecord, DhtKey, DhtStorablePacket, EmailDeleteRequest, IndexDeleteRequest,
    StorableType, Timestamp,
};
use tracing::info;

use crate::error::Result;

/// Result of storing a packet locally
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Packet (or new index entries) written
    Stored,
    /// Same key already stored; nothing was overwritten
    Duplicate,
    /// Packet refused: wrong type, bad signature or already deleted
    Rejected,
}

/// A delete request routed to the handler of its packet type
#[derive(Clone, Copy, Debug)]
pub enum DeleteRequest<'a> {
    /// Delete an encrypted email packet
    Email(&'a EmailDeleteRequest),
    /// Delete entries from an index packet
    Index(&'a IndexDeleteRequest),
}

/// Storage contract for one packet type.
///
/// Handlers do blocking file I/O; async callers should run them on a
/// blocking thread.
pub trait DhtStorageHandler: Send + Sync {
    /// Type of packet this handler stores
    fn packet_type(&self) -> StorableType;

    /// Store a packet. Existing packets are never overwritten.
    fn store(&self, packet: &DhtStorablePacket) -> Result<StoreOutcome>;

    /// Packet stored under `key`; `None` when there is none
    fn retrieve(&self, key: &DhtKey) -> Result<Option<DhtStorablePacket>>;

    /// Every stored packet
    fn individual_packets(&self) -> Result<Vec<DhtStorablePacket>>;

    /// Apply a delete request. Returns whether anything was deleted; this
    /// must not be revealed to the requester.
    fn process_delete(&self, request: DeleteRequest<'_>) -> Result<bool>;

    /// Deletion records for `key`
    fn deletion_records(&self, key: &DhtKey) -> Result<Vec<DeletionRecord>>;

    /// Purge packets and deletion records older than `max_age`. Returns the
    /// number of packets removed.
    fn delete_expired(&self, max_age: Duration, now: Timestamp) -> Result<usize>;
}

/// The storage handlers of one node, keyed by packet type
#[derive(Clone)]
pub struct PacketStorage {
    handlers: HashMap<StorableType, Arc<dyn DhtStorageHandler>>,
}

impl PacketStorage {
    /// Open all handlers under `root`, each limited to `max_bytes_per_type`
    pub fn open(root: impl AsRef<Path>, max_bytes_per_type: u64) -> Result<Self> {
        let root = root.as_ref();
        let db = sled::open(root.join("deletions"))?;
        Self::open_with_db(root, &db, max_bytes_per_type)
    }

    /// Open all handlers under `root` using an already open sled database
    pub fn open_with_db(root: &Path, db: &sled::Db, max_bytes_per_type: u64) -> Result<Self> {
        let email = EmailPacketFolder::open(
            root.join(StorableType::EncryptedEmail.folder_name()),
            DeletionLog::open(db, StorableType::EncryptedEmail)?,
            max_bytes_per_type,
        )?;
        let index = IndexPacketFolder::open(
            root.join(StorableType::Index.folder_name()),
            DeletionLog::open(db, StorableType::Index)?,
            max_bytes_per_type,
        )?;
        let directory = DirectoryEntryFolder::open(
            root.join(StorableType::DirectoryEntry.folder_name()),
            max_bytes_per_type,
        )?;
        info!("Packet storage opened at {}", root.display());

        let mut storage = Self {
            handlers: HashMap::new(),
        };
        storage.register(Arc::new(email));
        storage.register(Arc::new(index));
        storage.register(Arc::new(directory));
        Ok(storage)
    }

    /// Register (or replace) the handler for its packet type
    pub fn register(&mut self, handler: Arc<dyn DhtStorageHandler>) {
        self.handlers.insert(handler.packet_type(), handler);
    }

    /// Handler for `storable`
    pub fn handler(&self, storable: StorableType) -> Option<Arc<dyn DhtStorageHandler>> {
        self.handlers.get(&storable).cloned()
    }

    /// All handlers
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn DhtStorageHandler>> {
        self.handlers.values()
    }

    /// Store a packet with the handler for its type
    pub fn store(&self, packet: &DhtStorablePacket) -> Result<StoreOutcome> {
        match self.handlers.get(&packet.storable_type()) {
            Some(handler) => handler.store(packet),
            None => Ok(StoreOutcome::Rejected),
        }
    }

    /// Retrieve a packet of type `storable`
    pub fn retrieve(
        &self,
        key: &DhtKey,
        storable: StorableType,
    ) -> Result<Option<DhtStorablePacket>> {
        match self.handlers.get(&storable) {
            Some(handler) => handler.retrieve(key),
            None => Ok(None),
        }
    }

    /// Route a delete request to the matching handler
    pub fn process_delete(&self, request: DeleteRequest<'_>) -> Result<bool> {
        let storable = match request {
            DeleteRequest::Email(_) => StorableType::EncryptedEmail,
            DeleteRequest::Index(_) => StorableType::Index,
        };
        match self.handlers.get(&storable) {
            Some(handler) => handler.process_delete(request),
            None => Ok(false),
        }
    }

    /// Deletion records for `key` across all handlers
    pub fn deletion_records(&self, key: &DhtKey) -> Result<Vec<DeletionRecord>> {
        let mut records = Vec::new();
        for handler in self.handlers.values() {
            records.extend(handler.deletion_records(key)?);
        }
        Ok(records)
    }

    /// Purge expired packets across all handlers
    pub fn delete_expired(&self, max_age: Duration, now: Timestamp) -> Result<usize> {
        let mut total = 0;
        for handler in self.handlers.values() {
            total += handler.delete_expired(max_age, now)?;
        }
        Ok(total)
    }
}
