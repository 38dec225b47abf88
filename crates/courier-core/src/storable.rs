//! Content-addressed packets that can be stored in the DHT
//!
//! Every storable packet carries the key it is stored under, and that key is
//! derived from the packet's own contents so that any holder can check it:
//!
//! | Packet | Tag | Key |
//! |---|---|---|
//! | [`EncryptedEmailPacket`] | `E` | `SHA-256(u16_be(len) ‖ encrypted)` |
//! | [`IndexPacket`] | `I` | destination hash of the recipient |
//! | [`DirectoryEntry`] | `C` | `SHA-256(lowercase(name))` |

use std::fmt;

use bytes::Bytes;
use courier_crypto::{sha256_parts, verify_signature, DeleteAuthorization, DirectorySigner};

use crate::codec::{PacketReader, PacketWriter, WireBody};
use crate::data::DataPacket;
use crate::error::{PacketError, Result};
use crate::types::{DhtKey, Hash256, Timestamp};

/// Longest accepted directory entry name
pub const MAX_NAME_LENGTH: usize = 256;

/// Kind of storable packet; each kind has its own storage folder
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorableType {
    /// Encrypted email body
    EncryptedEmail,
    /// Per-recipient list of email packet keys
    Index,
    /// Signed name to public key binding
    DirectoryEntry,
}

impl StorableType {
    /// All storable types
    pub const ALL: [StorableType; 3] = [
        StorableType::EncryptedEmail,
        StorableType::Index,
        StorableType::DirectoryEntry,
    ];

    /// Wire type tag
    pub fn tag(&self) -> u8 {
        match self {
            StorableType::EncryptedEmail => EncryptedEmailPacket::TAG,
            StorableType::Index => IndexPacket::TAG,
            StorableType::DirectoryEntry => DirectoryEntry::TAG,
        }
    }

    /// Parse a wire type tag
    pub fn from_tag(tag: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.tag() == tag)
            .ok_or(PacketError::UnknownType(tag))
    }

    /// Directory name used by on-disk storage
    pub fn folder_name(&self) -> &'static str {
        match self {
            StorableType::EncryptedEmail => "email",
            StorableType::Index => "index",
            StorableType::DirectoryEntry => "directory",
        }
    }
}

impl fmt::Display for StorableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder_name())
    }
}

/// Encrypted email content.
///
/// The owner keeps the [`DeleteAuthorization`] inside the encrypted payload;
/// storage nodes only see its verification hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedEmailPacket {
    key: DhtKey,
    delete_verification_hash: [u8; 32],
    encryption_type: u8,
    encrypted: Bytes,
}

impl EncryptedEmailPacket {
    /// Build a packet, deriving its key from the encrypted bytes
    pub fn new(
        delete_verification_hash: [u8; 32],
        encryption_type: u8,
        encrypted: impl Into<Bytes>,
    ) -> Result<Self> {
        let encrypted = encrypted.into();
        let key = Self::compute_key(&encrypted)?;
        Ok(Self {
            key,
            delete_verification_hash,
            encryption_type,
            encrypted,
        })
    }

    /// Content key: SHA-256 over the length-prefixed encrypted bytes
    pub fn compute_key(encrypted: &[u8]) -> Result<DhtKey> {
        let len = u16::try_from(encrypted.len()).map_err(|_| PacketError::TooLarge {
            size: encrypted.len(),
            max: u16::MAX as usize,
        })?;
        Ok(Hash256::new(sha256_parts(&[&len.to_be_bytes(), encrypted])))
    }

    /// DHT key
    pub fn key(&self) -> DhtKey {
        self.key
    }

    /// Hash of the delete authorization
    pub fn delete_verification_hash(&self) -> &[u8; 32] {
        &self.delete_verification_hash
    }

    /// Cipher identifier
    pub fn encryption_type(&self) -> u8 {
        self.encryption_type
    }

    /// Encrypted payload
    pub fn encrypted(&self) -> &Bytes {
        &self.encrypted
    }

    /// Whether `authorization` unlocks deletion of this packet
    pub fn is_delete_authorized(&self, authorization: &DeleteAuthorization) -> bool {
        authorization.matches(&self.delete_verification_hash)
    }
}

impl WireBody for EncryptedEmailPacket {
    const TAG: u8 = b'E';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        writer.put_hash(&self.key);
        writer.put_slice(&self.delete_verification_hash);
        writer.put_u8(self.encryption_type);
        writer.put_bytes16(&self.encrypted)
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        let key = reader.get_hash()?;
        let delete_verification_hash = reader.get_array::<32>()?;
        let encryption_type = reader.get_u8()?;
        let encrypted = Bytes::copy_from_slice(reader.get_bytes16()?);

        let packet = Self::new(delete_verification_hash, encryption_type, encrypted)?;
        if packet.key != key {
            return Err(PacketError::KeyMismatch);
        }
        Ok(packet)
    }
}

/// One email packet announced to a recipient
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Key of the email packet
    pub email_key: DhtKey,
    /// Verification hash of the index entry's own delete authorization
    pub delete_verification_hash: [u8; 32],
    /// When the entry was first stored
    pub store_time: Timestamp,
}

/// All email packet keys waiting for one recipient
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexPacket {
    destination_hash: Hash256,
    entries: Vec<IndexEntry>,
}

impl IndexPacket {
    /// Empty index for a recipient
    pub fn new(destination_hash: Hash256) -> Self {
        Self {
            destination_hash,
            entries: Vec::new(),
        }
    }

    /// Index holding the given entries
    pub fn with_entries(destination_hash: Hash256, entries: Vec<IndexEntry>) -> Self {
        let mut packet = Self::new(destination_hash);
        for entry in entries {
            packet.add_entry(entry);
        }
        packet
    }

    /// Destination hash, which is also the DHT key
    pub fn destination_hash(&self) -> Hash256 {
        self.destination_hash
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Whether the index has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry for an email packet
    pub fn entry(&self, email_key: &DhtKey) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| &e.email_key == email_key)
    }

    /// Add an entry unless one with the same email key exists.
    /// Returns whether the entry was added.
    pub fn add_entry(&mut self, entry: IndexEntry) -> bool {
        if self.entry(&entry.email_key).is_some() {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Add every entry of `other` not already present.
    /// Returns the number of entries added.
    pub fn merge(&mut self, other: &IndexPacket) -> usize {
        other
            .entries
            .iter()
            .filter(|entry| self.add_entry((*entry).clone()))
            .count()
    }

    /// Remove and return the entry for an email packet
    pub fn remove_entry(&mut self, email_key: &DhtKey) -> Option<IndexEntry> {
        let pos = self.entries.iter().position(|e| &e.email_key == email_key)?;
        Some(self.entries.remove(pos))
    }

    /// Drop entries stored before `cutoff`. Returns the number removed.
    pub fn retain_newer_than(&mut self, cutoff: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.store_time >= cutoff);
        before - self.entries.len()
    }
}

impl WireBody for IndexPacket {
    const TAG: u8 = b'I';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        let count = u16::try_from(self.entries.len()).map_err(|_| PacketError::TooLarge {
            size: self.entries.len(),
            max: u16::MAX as usize,
        })?;
        writer.put_hash(&self.destination_hash);
        writer.put_u16(count);
        for entry in &self.entries {
            writer.put_hash(&entry.email_key);
            writer.put_slice(&entry.delete_verification_hash);
            writer.put_timestamp(entry.store_time);
        }
        Ok(())
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        let destination_hash = reader.get_hash()?;
        let count = reader.get_u16()? as usize;
        let mut packet = Self::new(destination_hash);
        for _ in 0..count {
            packet.add_entry(IndexEntry {
                email_key: reader.get_hash()?,
                delete_verification_hash: reader.get_array::<32>()?,
                store_time: reader.get_timestamp()?,
            });
        }
        Ok(packet)
    }
}

/// Signed binding of a human-readable name to a public key
#[derive(Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    key: DhtKey,
    name: String,
    public_key: [u8; 32],
    created: Timestamp,
    signature: [u8; 64],
}

impl DirectoryEntry {
    /// Create and sign an entry
    pub fn create(name: &str, signer: &DirectorySigner, created: Timestamp) -> Result<Self> {
        Self::check_name(name)?;
        let public_key = signer.public_key();
        let signature = signer.sign(&Self::signed_bytes(name, &public_key, created));
        Ok(Self {
            key: Self::key_for_name(name),
            name: name.to_string(),
            public_key,
            created,
            signature,
        })
    }

    /// Key under which the entry for `name` is stored
    pub fn key_for_name(name: &str) -> DhtKey {
        Hash256::digest(name.to_lowercase().as_bytes())
    }

    /// Bytes covered by the signature
    pub fn signed_bytes(name: &str, public_key: &[u8; 32], created: Timestamp) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(name.len() + 40);
        bytes.extend_from_slice(name.as_bytes());
        bytes.extend_from_slice(public_key);
        bytes.extend_from_slice(&(created.as_millis().max(0) as u64).to_be_bytes());
        bytes
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_NAME_LENGTH {
            return Err(PacketError::Malformed(format!(
                "directory name length {} outside 1..={}",
                name.len(),
                MAX_NAME_LENGTH
            )));
        }
        Ok(())
    }

    /// DHT key
    pub fn key(&self) -> DhtKey {
        self.key
    }

    /// Registered name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ed25519 public key bound to the name
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Creation time
    pub fn created(&self) -> Timestamp {
        self.created
    }

    /// Check the signature against the embedded public key
    pub fn verify(&self) -> bool {
        let message = Self::signed_bytes(&self.name, &self.public_key, self.created);
        verify_signature(&self.public_key, &message, &self.signature).is_ok()
    }
}

impl fmt::Debug for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryEntry")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

impl WireBody for DirectoryEntry {
    const TAG: u8 = b'C';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        writer.put_hash(&self.key);
        writer.put_string16(&self.name)?;
        writer.put_slice(&self.public_key);
        writer.put_timestamp(self.created);
        writer.put_slice(&self.signature);
        Ok(())
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        let key = reader.get_hash()?;
        let name = reader.get_string16()?;
        Self::check_name(&name)?;
        let public_key = reader.get_array::<32>()?;
        let created = reader.get_timestamp()?;
        let signature = reader.get_array::<64>()?;

        if Self::key_for_name(&name) != key {
            return Err(PacketError::KeyMismatch);
        }
        Ok(Self {
            key,
            name,
            public_key,
            created,
            signature,
        })
    }
}

/// Any packet that can be stored in the DHT
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhtStorablePacket {
    /// Encrypted email body
    EncryptedEmail(EncryptedEmailPacket),
    /// Recipient index
    Index(IndexPacket),
    /// Directory entry
    DirectoryEntry(DirectoryEntry),
}

impl DhtStorablePacket {
    /// DHT key the packet is stored under
    pub fn key(&self) -> DhtKey {
        match self {
            DhtStorablePacket::EncryptedEmail(p) => p.key(),
            DhtStorablePacket::Index(p) => p.destination_hash(),
            DhtStorablePacket::DirectoryEntry(p) => p.key(),
        }
    }

    /// Packet kind
    pub fn storable_type(&self) -> StorableType {
        match self {
            DhtStorablePacket::EncryptedEmail(_) => StorableType::EncryptedEmail,
            DhtStorablePacket::Index(_) => StorableType::Index,
            DhtStorablePacket::DirectoryEntry(_) => StorableType::DirectoryEntry,
        }
    }

    /// Encode as a standalone data packet
    pub fn encode(&self) -> Result<Bytes> {
        DataPacket::Storable(self.clone()).encode()
    }

    /// Decode a standalone data packet that must be storable
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match DataPacket::decode(bytes)? {
            DataPacket::Storable(packet) => Ok(packet),
            other => Err(PacketError::Malformed(format!(
                "expected a storable packet, got type {}",
                other.tag() as char
            ))),
        }
    }

    pub(crate) fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        match self {
            DhtStorablePacket::EncryptedEmail(p) => p.encode_body(writer),
            DhtStorablePacket::Index(p) => p.encode_body(writer),
            DhtStorablePacket::DirectoryEntry(p) => p.encode_body(writer),
        }
    }
}

impl From<EncryptedEmailPacket> for DhtStorablePacket {
    fn from(packet: EncryptedEmailPacket) -> Self {
        DhtStorablePacket::EncryptedEmail(packet)
    }
}

impl From<IndexPacket> for DhtStorablePacket {
    fn from(packet: IndexPacket) -> Self {
        DhtStorablePacket::Index(packet)
    }
}

impl From<DirectoryEntry> for DhtStorablePacket {
    fn from(packet: DirectoryEntry) -> Self {
        DhtStorablePacket::DirectoryEntry(packet)
    }
}
