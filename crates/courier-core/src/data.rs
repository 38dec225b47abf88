//! Data packets: payloads carried inside responses and store requests

use bytes::Bytes;
use courier_crypto::DeleteAuthorization;
use serde::{Deserialize, Serialize};

use crate::codec::{PacketReader, PacketWriter, WireBody};
use crate::error::{PacketError, Result};
use crate::storable::{DhtStorablePacket, DirectoryEntry, EncryptedEmailPacket, IndexPacket};
use crate::types::{DhtKey, PeerIdentity, Timestamp};
use crate::{is_version_compatible, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};

/// Peers returned in answer to a `FindClosePeers` request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerList {
    /// Peer destinations, closest first
    pub peers: Vec<PeerIdentity>,
}

impl PeerList {
    /// Wrap a list of peers
    pub fn new(peers: Vec<PeerIdentity>) -> Self {
        Self { peers }
    }
}

impl WireBody for PeerList {
    const TAG: u8 = b'L';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        let count = u16::try_from(self.peers.len()).map_err(|_| PacketError::TooLarge {
            size: self.peers.len(),
            max: u16::MAX as usize,
        })?;
        writer.put_u16(count);
        for peer in &self.peers {
            writer.put_bytes16(peer.as_bytes())?;
        }
        Ok(())
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        let count = reader.get_u16()? as usize;
        let mut peers = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let bytes = reader.get_bytes16()?;
            peers.push(PeerIdentity::new(Bytes::copy_from_slice(bytes))?);
        }
        Ok(Self { peers })
    }
}

/// Proof that a stored packet was deleted by its owner.
///
/// Kept by storage nodes after a successful delete so that stale replicas
/// arriving later are recognised and refused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRecord {
    /// Key of the deleted packet
    pub key: DhtKey,
    /// Authorization that was presented for the delete
    pub authorization: DeleteAuthorization,
    /// When the deletion happened
    pub store_time: Timestamp,
}

/// Deletion records returned in answer to a `DeletionQuery`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeletionInfo {
    /// Known deletions
    pub records: Vec<DeletionRecord>,
}

impl DeletionInfo {
    /// Wrap a list of records
    pub fn new(records: Vec<DeletionRecord>) -> Self {
        Self { records }
    }

    /// Record for `key`, if present
    pub fn find(&self, key: &DhtKey) -> Option<&DeletionRecord> {
        self.records.iter().find(|r| &r.key == key)
    }
}

impl WireBody for DeletionInfo {
    const TAG: u8 = b'T';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        let count = u16::try_from(self.records.len()).map_err(|_| PacketError::TooLarge {
            size: self.records.len(),
            max: u16::MAX as usize,
        })?;
        writer.put_u16(count);
        for record in &self.records {
            writer.put_hash(&record.key);
            writer.put_slice(record.authorization.as_bytes());
            writer.put_timestamp(record.store_time);
        }
        Ok(())
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        let count = reader.get_u16()? as usize;
        let mut records = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            records.push(DeletionRecord {
                key: reader.get_hash()?,
                authorization: DeleteAuthorization::from_bytes(reader.get_array::<32>()?),
                store_time: reader.get_timestamp()?,
            });
        }
        Ok(Self { records })
    }
}

/// Any data packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataPacket {
    /// `L`
    PeerList(PeerList),
    /// `T`
    DeletionInfo(DeletionInfo),
    /// `E`, `I` or `C`
    Storable(DhtStorablePacket),
}

type DecodeFn = fn(&mut PacketReader<'_>) -> Result<DataPacket>;

fn decode_as<T>(reader: &mut PacketReader<'_>) -> Result<DataPacket>
where
    T: WireBody + Into<DataPacket>,
{
    T::decode_body(reader).map(Into::into)
}

/// Tag to decoder table for data packets
const DECODERS: &[(u8, DecodeFn)] = &[
    (PeerList::TAG, decode_as::<PeerList>),
    (DeletionInfo::TAG, decode_as::<DeletionInfo>),
    (EncryptedEmailPacket::TAG, decode_as::<EncryptedEmailPacket>),
    (IndexPacket::TAG, decode_as::<IndexPacket>),
    (DirectoryEntry::TAG, decode_as::<DirectoryEntry>),
];

impl DataPacket {
    /// Wire type tag
    pub fn tag(&self) -> u8 {
        match self {
            DataPacket::PeerList(_) => PeerList::TAG,
            DataPacket::DeletionInfo(_) => DeletionInfo::TAG,
            DataPacket::Storable(p) => p.storable_type().tag(),
        }
    }

    /// Encode with header
    pub fn encode(&self) -> Result<Bytes> {
        let mut writer = PacketWriter::with_capacity(256);
        self.write_to(&mut writer)?;
        if writer.len() > MAX_DATAGRAM_SIZE {
            return Err(PacketError::TooLarge {
                size: writer.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        Ok(writer.into_bytes())
    }

    pub(crate) fn write_to(&self, writer: &mut PacketWriter) -> Result<()> {
        writer.put_u8(self.tag());
        writer.put_u8(PROTOCOL_VERSION);
        match self {
            DataPacket::PeerList(p) => p.encode_body(writer),
            DataPacket::DeletionInfo(p) => p.encode_body(writer),
            DataPacket::Storable(p) => p.encode_body(writer),
        }
    }

    /// Decode a data packet with header
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(bytes);
        let tag = reader.get_u8()?;
        let version = reader.get_u8()?;
        if !is_version_compatible(version) {
            return Err(PacketError::IncompatibleVersion(version));
        }
        let decode = DECODERS
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, f)| *f)
            .ok_or(PacketError::UnknownType(tag))?;
        decode(&mut reader)
    }

    /// The storable packet, if this is one
    pub fn into_storable(self) -> Option<DhtStorablePacket> {
        match self {
            DataPacket::Storable(p) => Some(p),
            _ => None,
        }
    }
}

impl From<PeerList> for DataPacket {
    fn from(packet: PeerList) -> Self {
        DataPacket::PeerList(packet)
    }
}

impl From<DeletionInfo> for DataPacket {
    fn from(packet: DeletionInfo) -> Self {
        DataPacket::DeletionInfo(packet)
    }
}

impl From<DhtStorablePacket> for DataPacket {
    fn from(packet: DhtStorablePacket) -> Self {
        DataPacket::Storable(packet)
    }
}

impl From<EncryptedEmailPacket> for DataPacket {
    fn from(packet: EncryptedEmailPacket) -> Self {
        DataPacket::Storable(packet.into())
    }
}

impl From<IndexPacket> for DataPacket {
    fn from(packet: IndexPacket) -> Self {
        DataPacket::Storable(packet.into())
    }
}

impl From<DirectoryEntry> for DataPacket {
    fn from(packet: DirectoryEntry) -> Self {
        DataPacket::Storable(packet.into())
    }
}
