//! # Courier Core
//!
//! Types shared by every Courier component: 256-bit identifiers and the
//! XOR metric, peer identities, timestamps, and the binary wire format.
//!
//! ## Wire format
//!
//! Every packet starts with a one-byte type tag and a one-byte protocol
//! version. Communication packets (requests and responses exchanged between
//! peers) follow with a 32-byte packet id; data packets (peer lists,
//! deletion info and DHT-storable content) follow directly with their body.
//! Decoding dispatches on the tag through a static registry.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod codec;
pub mod data;
pub mod error;
pub mod packet;
pub mod storable;
pub mod types;

pub use data::{DataPacket, DeletionInfo, DeletionRecord, PeerList};
pub use error::{PacketError, Result};
pub use packet::{
    peek_header, CommunicationBody, CommunicationPacket, DeletionQuery, EmailDeleteRequest,
    FindClosePeers, IndexDeleteEntry, IndexDeleteRequest, RelayRequest, ResponsePacket,
    RetrieveRequest, StatusCode, StoreRequest,
};
pub use storable::{
    DhtStorablePacket, DirectoryEntry, EncryptedEmailPacket, IndexEntry, IndexPacket, StorableType,
};
pub use types::{DhtKey, Distance, Hash256, PacketId, PeerId, PeerIdentity, Timestamp};

/// Protocol version written into every outgoing packet
pub const PROTOCOL_VERSION: u8 = 4;

/// Oldest protocol version still understood; senders below it are banned
pub const MIN_PROTOCOL_VERSION: u8 = 4;

/// Largest datagram the transport will carry
pub const MAX_DATAGRAM_SIZE: usize = 31 * 1024;

/// Whether packets of `version` can be processed by this node
pub fn is_version_compatible(version: u8) -> bool {
    version >= MIN_PROTOCOL_VERSION
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::data::{DataPacket, DeletionInfo, DeletionRecord, PeerList};
    pub use crate::error::{PacketError, Result};
    pub use crate::packet::{CommunicationBody, CommunicationPacket, StatusCode};
    pub use crate::storable::{DhtStorablePacket, StorableType};
    pub use crate::types::{DhtKey, Distance, Hash256, PacketId, PeerId, PeerIdentity, Timestamp};
}
