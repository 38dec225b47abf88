//! Communication packets exchanged between peers
//!
//! Every communication packet carries a random [`PacketId`]; a
//! [`ResponsePacket`] echoes the id of the request it answers, which is how
//! replies are matched to the batch that sent the request.

use bytes::Bytes;
use courier_crypto::{sha256, DeleteAuthorization, HashcashStamp};

use crate::codec::{PacketReader, PacketWriter, WireBody};
use crate::data::DataPacket;
use crate::error::{PacketError, Result};
use crate::storable::{DhtStorablePacket, StorableType};
use crate::types::{DhtKey, Hash256, PacketId, PeerIdentity};
use crate::{is_version_compatible, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};

/// Most entries an index delete request can carry
pub const MAX_INDEX_DELETE_ENTRIES: usize = u8::MAX as usize;

/// Result code carried by a [`ResponsePacket`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    /// Request handled
    Ok = 0,
    /// Unspecified failure
    GeneralError = 1,
    /// Nothing stored under the requested key
    NoDataFound = 2,
    /// Request could not be processed
    InvalidPacket = 3,
    /// Proof-of-work stamp is invalid
    InvalidHashcash = 4,
    /// Proof-of-work stamp is too cheap
    InsufficientHashcash = 5,
    /// Storage is full
    NoDiskSpace = 6,
}

impl StatusCode {
    /// Parse a status byte
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => StatusCode::Ok,
            1 => StatusCode::GeneralError,
            2 => StatusCode::NoDataFound,
            3 => StatusCode::InvalidPacket,
            4 => StatusCode::InvalidHashcash,
            5 => StatusCode::InsufficientHashcash,
            6 => StatusCode::NoDiskSpace,
            other => {
                return Err(PacketError::Malformed(format!(
                    "unknown status code {}",
                    other
                )))
            }
        })
    }
}

/// Ask a peer for the peers it knows closest to `key`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FindClosePeers {
    /// Lookup target
    pub key: DhtKey,
}

impl WireBody for FindClosePeers {
    const TAG: u8 = b'F';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        writer.put_hash(&self.key);
        Ok(())
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        Ok(Self {
            key: reader.get_hash()?,
        })
    }
}

/// Ask a peer for a stored packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrieveRequest {
    /// Key of the packet
    pub key: DhtKey,
    /// Expected packet kind
    pub data_type: StorableType,
}

impl WireBody for RetrieveRequest {
    const TAG: u8 = b'Q';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        writer.put_hash(&self.key);
        writer.put_u8(self.data_type.tag());
        Ok(())
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        Ok(Self {
            key: reader.get_hash()?,
            data_type: StorableType::from_tag(reader.get_u8()?)?,
        })
    }
}

/// Ask a peer to store a packet. The stamp must be bound to the packet key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreRequest {
    /// Hashcash stamp in string form
    pub stamp: String,
    /// Packet to store
    pub packet: DhtStorablePacket,
}

impl StoreRequest {
    /// Stamp resource for a packet key
    pub fn resource_for(key: &DhtKey) -> String {
        HashcashStamp::resource_for(key.as_bytes())
    }

    /// Stamp resource this request must carry
    pub fn resource(&self) -> String {
        Self::resource_for(&self.packet.key())
    }
}

impl WireBody for StoreRequest {
    const TAG: u8 = b'S';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        writer.put_string16(&self.stamp)?;
        let packet = self.packet.encode()?;
        writer.put_bytes16(&packet)
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        let stamp = reader.get_string16()?;
        let packet = DhtStorablePacket::decode(reader.get_bytes16()?)?;
        Ok(Self { stamp, packet })
    }
}

/// Answer to any request; its packet id equals the request's
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponsePacket {
    /// Outcome
    pub status: StatusCode,
    /// Returned data, if any
    pub payload: Option<DataPacket>,
}

impl ResponsePacket {
    /// Response with a status and no payload
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            payload: None,
        }
    }

    /// Successful response carrying data
    pub fn ok(payload: impl Into<DataPacket>) -> Self {
        Self {
            status: StatusCode::Ok,
            payload: Some(payload.into()),
        }
    }
}

impl WireBody for ResponsePacket {
    const TAG: u8 = b'N';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        writer.put_u8(self.status as u8);
        match &self.payload {
            Some(payload) => writer.put_bytes16(&payload.encode()?),
            None => writer.put_bytes16(&[]),
        }
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        let status = StatusCode::from_u8(reader.get_u8()?)?;
        let payload = reader.get_bytes16()?;
        let payload = if payload.is_empty() {
            None
        } else {
            Some(DataPacket::decode(payload)?)
        };
        Ok(Self { status, payload })
    }
}

/// Ask a peer whether it knows `key` was deleted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletionQuery {
    /// Key of the packet
    pub key: DhtKey,
}

impl WireBody for DeletionQuery {
    const TAG: u8 = b'Y';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        writer.put_hash(&self.key);
        Ok(())
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        Ok(Self {
            key: reader.get_hash()?,
        })
    }
}

/// Delete an encrypted email packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailDeleteRequest {
    /// Key of the email packet
    pub key: DhtKey,
    /// Token whose hash must match the stored verification hash
    pub authorization: DeleteAuthorization,
}

impl WireBody for EmailDeleteRequest {
    const TAG: u8 = b'D';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        writer.put_hash(&self.key);
        writer.put_slice(self.authorization.as_bytes());
        Ok(())
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        Ok(Self {
            key: reader.get_hash()?,
            authorization: DeleteAuthorization::from_bytes(reader.get_array::<32>()?),
        })
    }
}

/// One entry of an [`IndexDeleteRequest`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDeleteEntry {
    /// Email packet key listed in the index
    pub email_key: DhtKey,
    /// Token for that index entry
    pub authorization: DeleteAuthorization,
}

/// Delete entries from a recipient's index packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDeleteRequest {
    /// Index key
    pub destination_hash: Hash256,
    /// Entries to remove
    pub entries: Vec<IndexDeleteEntry>,
}

impl WireBody for IndexDeleteRequest {
    const TAG: u8 = b'X';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        let count = u8::try_from(self.entries.len()).map_err(|_| PacketError::TooLarge {
            size: self.entries.len(),
            max: MAX_INDEX_DELETE_ENTRIES,
        })?;
        writer.put_hash(&self.destination_hash);
        writer.put_u8(count);
        for entry in &self.entries {
            writer.put_hash(&entry.email_key);
            writer.put_slice(entry.authorization.as_bytes());
        }
        Ok(())
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        let destination_hash = reader.get_hash()?;
        let count = reader.get_u8()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(IndexDeleteEntry {
                email_key: reader.get_hash()?,
                authorization: DeleteAuthorization::from_bytes(reader.get_array::<32>()?),
            });
        }
        Ok(Self {
            destination_hash,
            entries,
        })
    }
}

/// Store-and-forward wrapper around another communication packet.
///
/// `payload` is an encoded [`StoreRequest`] (to be stored by the receiver)
/// or another [`RelayRequest`] (to be forwarded to `next_hop` after
/// roughly `delay_millis`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayRequest {
    /// Hashcash stamp bound to the payload hash
    pub stamp: String,
    /// Requested forwarding delay
    pub delay_millis: u32,
    /// Where a nested relay request goes next
    pub next_hop: Option<PeerIdentity>,
    /// Encoded inner communication packet
    pub payload: Bytes,
}

impl RelayRequest {
    /// Stamp resource for a payload
    pub fn resource_for(payload: &[u8]) -> String {
        HashcashStamp::resource_for(&sha256(payload))
    }

    /// Stamp resource this request must carry
    pub fn resource(&self) -> String {
        Self::resource_for(&self.payload)
    }

    /// Hash of the payload, used to name queued relay files
    pub fn payload_hash(&self) -> Hash256 {
        Hash256::digest(&self.payload)
    }

    /// Decode the inner packet
    pub fn payload_packet(&self) -> Result<CommunicationPacket> {
        CommunicationPacket::decode(&self.payload)
    }
}

impl WireBody for RelayRequest {
    const TAG: u8 = b'R';

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        writer.put_string16(&self.stamp)?;
        writer.put_u32(self.delay_millis);
        match &self.next_hop {
            Some(hop) => writer.put_bytes16(hop.as_bytes())?,
            None => writer.put_bytes16(&[])?,
        }
        writer.put_bytes16(&self.payload)
    }

    fn decode_body(reader: &mut PacketReader<'_>) -> Result<Self> {
        let stamp = reader.get_string16()?;
        let delay_millis = reader.get_u32()?;
        let hop = reader.get_bytes16()?;
        let next_hop = if hop.is_empty() {
            None
        } else {
            Some(PeerIdentity::new(Bytes::copy_from_slice(hop))?)
        };
        let payload = Bytes::copy_from_slice(reader.get_bytes16()?);
        Ok(Self {
            stamp,
            delay_millis,
            next_hop,
            payload,
        })
    }
}

/// Body of a communication packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommunicationBody {
    /// `F`
    FindClosePeers(FindClosePeers),
    /// `Q`
    Retrieve(RetrieveRequest),
    /// `S`
    Store(StoreRequest),
    /// `N`
    Response(ResponsePacket),
    /// `Y`
    DeletionQuery(DeletionQuery),
    /// `D`
    EmailDelete(EmailDeleteRequest),
    /// `X`
    IndexDelete(IndexDeleteRequest),
    /// `R`
    Relay(RelayRequest),
}

macro_rules! impl_from_body {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for CommunicationBody {
                fn from(body: $ty) -> Self {
                    CommunicationBody::$variant(body)
                }
            }
        )*
    };
}

impl_from_body!(
    FindClosePeers(FindClosePeers),
    Retrieve(RetrieveRequest),
    Store(StoreRequest),
    Response(ResponsePacket),
    DeletionQuery(DeletionQuery),
    EmailDelete(EmailDeleteRequest),
    IndexDelete(IndexDeleteRequest),
    Relay(RelayRequest),
);

impl CommunicationBody {
    /// Wire type tag
    pub fn tag(&self) -> u8 {
        match self {
            CommunicationBody::FindClosePeers(_) => FindClosePeers::TAG,
            CommunicationBody::Retrieve(_) => RetrieveRequest::TAG,
            CommunicationBody::Store(_) => StoreRequest::TAG,
            CommunicationBody::Response(_) => ResponsePacket::TAG,
            CommunicationBody::DeletionQuery(_) => DeletionQuery::TAG,
            CommunicationBody::EmailDelete(_) => EmailDeleteRequest::TAG,
            CommunicationBody::IndexDelete(_) => IndexDeleteRequest::TAG,
            CommunicationBody::Relay(_) => RelayRequest::TAG,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            CommunicationBody::FindClosePeers(_) => "FindClosePeers",
            CommunicationBody::Retrieve(_) => "RetrieveRequest",
            CommunicationBody::Store(_) => "StoreRequest",
            CommunicationBody::Response(_) => "ResponsePacket",
            CommunicationBody::DeletionQuery(_) => "DeletionQuery",
            CommunicationBody::EmailDelete(_) => "EmailDeleteRequest",
            CommunicationBody::IndexDelete(_) => "IndexDeleteRequest",
            CommunicationBody::Relay(_) => "RelayRequest",
        }
    }

    fn encode_body(&self, writer: &mut PacketWriter) -> Result<()> {
        match self {
            CommunicationBody::FindClosePeers(b) => b.encode_body(writer),
            CommunicationBody::Retrieve(b) => b.encode_body(writer),
            CommunicationBody::Store(b) => b.encode_body(writer),
            CommunicationBody::Response(b) => b.encode_body(writer),
            CommunicationBody::DeletionQuery(b) => b.encode_body(writer),
            CommunicationBody::EmailDelete(b) => b.encode_body(writer),
            CommunicationBody::IndexDelete(b) => b.encode_body(writer),
            CommunicationBody::Relay(b) => b.encode_body(writer),
        }
    }
}

type DecodeFn = fn(&mut PacketReader<'_>) -> Result<CommunicationBody>;

fn decode_as<T>(reader: &mut PacketReader<'_>) -> Result<CommunicationBody>
where
    T: WireBody + Into<CommunicationBody>,
{
    T::decode_body(reader).map(Into::into)
}

/// Tag to decoder table for communication packets
const DECODERS: &[(u8, DecodeFn)] = &[
    (FindClosePeers::TAG, decode_as::<FindClosePeers>),
    (RetrieveRequest::TAG, decode_as::<RetrieveRequest>),
    (StoreRequest::TAG, decode_as::<StoreRequest>),
    (ResponsePacket::TAG, decode_as::<ResponsePacket>),
    (DeletionQuery::TAG, decode_as::<DeletionQuery>),
    (EmailDeleteRequest::TAG, decode_as::<EmailDeleteRequest>),
    (IndexDeleteRequest::TAG, decode_as::<IndexDeleteRequest>),
    (RelayRequest::TAG, decode_as::<RelayRequest>),
];

/// Whether `tag` names a communication packet
pub fn is_communication_tag(tag: u8) -> bool {
    DECODERS.iter().any(|(t, _)| *t == tag)
}

/// Read the type tag and version without decoding the body
pub fn peek_header(bytes: &[u8]) -> Result<(u8, u8)> {
    let mut reader = PacketReader::new(bytes);
    Ok((reader.get_u8()?, reader.get_u8()?))
}

/// A request or response exchanged between peers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommunicationPacket {
    /// Protocol version the sender declared
    pub version: u8,
    /// Correlation id
    pub packet_id: PacketId,
    /// Typed body
    pub body: CommunicationBody,
}

impl CommunicationPacket {
    /// New outgoing packet with a fresh id
    pub fn new(body: impl Into<CommunicationBody>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_id: PacketId::random(),
            body: body.into(),
        }
    }

    /// Response to the request with id `request_id`
    pub fn response_to(request_id: PacketId, response: ResponsePacket) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_id: request_id,
            body: CommunicationBody::Response(response),
        }
    }

    /// The response body, if this is a response
    pub fn as_response(&self) -> Option<&ResponsePacket> {
        match &self.body {
            CommunicationBody::Response(r) => Some(r),
            _ => None,
        }
    }

    /// Encode with header; fails if the result exceeds one datagram
    pub fn encode(&self) -> Result<Bytes> {
        let mut writer = PacketWriter::with_capacity(128);
        writer.put_u8(self.body.tag());
        writer.put_u8(PROTOCOL_VERSION);
        writer.put_slice(self.packet_id.as_bytes());
        self.body.encode_body(&mut writer)?;
        if writer.len() > MAX_DATAGRAM_SIZE {
            return Err(PacketError::TooLarge {
                size: writer.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        Ok(writer.into_bytes())
    }

    /// Decode a communication packet. Bytes after the body are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(bytes);
        let tag = reader.get_u8()?;
        let version = reader.get_u8()?;
        let decode = DECODERS
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, f)| *f)
            .ok_or(PacketError::UnknownType(tag))?;
        if !is_version_compatible(version) {
            return Err(PacketError::IncompatibleVersion(version));
        }
        let packet_id = PacketId::from_bytes(reader.get_array::<32>()?);
        let body = decode(&mut reader)?;
        Ok(Self {
            version,
            packet_id,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PeerList;
    use crate::storable::EncryptedEmailPacket;

    fn email_packet() -> DhtStorablePacket {
        let auth = DeleteAuthorization::generate();
        EncryptedEmailPacket::new(auth.verification_hash(), 1, b"sealed".to_vec())
            .unwrap()
            .into()
    }

    #[test]
    fn test_header_layout() {
        let packet = CommunicationPacket::new(FindClosePeers {
            key: Hash256::random(),
        });
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes[0], b'F');
        assert_eq!(bytes[1], PROTOCOL_VERSION);
        assert_eq!(&bytes[2..34], packet.packet_id.as_bytes());
        assert_eq!(bytes.len(), 66);
        assert_eq!(peek_header(&bytes).unwrap(), (b'F', PROTOCOL_VERSION));
    }

    #[test]
    fn test_store_request_round_trip() {
        let packet = CommunicationPacket::new(StoreRequest {
            stamp: "1:0:260101:abc::salt:0".to_string(),
            packet: email_packet(),
        });
        let decoded = CommunicationPacket::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_response_keeps_request_id() {
        let request = CommunicationPacket::new(RetrieveRequest {
            key: Hash256::random(),
            data_type: StorableType::Index,
        });
        let response = CommunicationPacket::response_to(
            request.packet_id,
            ResponsePacket::ok(PeerList::new(vec![PeerIdentity::random()])),
        );
        let decoded = CommunicationPacket::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded.packet_id, request.packet_id);
        assert_eq!(decoded.as_response().unwrap().status, StatusCode::Ok);
    }

    #[test]
    fn test_empty_response_payload() {
        let response = CommunicationPacket::response_to(
            PacketId::random(),
            ResponsePacket::status(StatusCode::NoDataFound),
        );
        let decoded = CommunicationPacket::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(
            decoded.as_response(),
            Some(&ResponsePacket::status(StatusCode::NoDataFound))
        );
    }

    #[test]
    fn test_nested_relay_payload() {
        let inner = CommunicationPacket::new(StoreRequest {
            stamp: "stamp".to_string(),
            packet: email_packet(),
        });
        let payload = inner.encode().unwrap();
        let relay = RelayRequest {
            stamp: "outer".to_string(),
            delay_millis: 5_000,
            next_hop: Some(PeerIdentity::random()),
            payload: payload.clone(),
        };
        let decoded = CommunicationPacket::decode(
            &CommunicationPacket::new(relay.clone()).encode().unwrap(),
        )
        .unwrap();
        match decoded.body {
            CommunicationBody::Relay(r) => {
                assert_eq!(r, relay);
                assert_eq!(r.payload_packet().unwrap(), inner);
                assert_eq!(r.resource(), RelayRequest::resource_for(&payload));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_index_delete_entry_limit() {
        let request = IndexDeleteRequest {
            destination_hash: Hash256::random(),
            entries: (0..=MAX_INDEX_DELETE_ENTRIES)
                .map(|_| IndexDeleteEntry {
                    email_key: Hash256::random(),
                    authorization: DeleteAuthorization::generate(),
                })
                .collect(),
        };
        assert!(matches!(
            CommunicationPacket::new(request).encode(),
            Err(PacketError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_incompatible_version() {
        let mut bytes = CommunicationPacket::new(DeletionQuery {
            key: Hash256::random(),
        })
        .encode()
        .unwrap()
        .to_vec();
        bytes[1] = 3;
        assert!(matches!(
            CommunicationPacket::decode(&bytes),
            Err(PacketError::IncompatibleVersion(3))
        ));
    }

    #[test]
    fn test_truncated_body() {
        let bytes = CommunicationPacket::new(DeletionQuery {
            key: Hash256::random(),
        })
        .encode()
        .unwrap();
        assert!(matches!(
            CommunicationPacket::decode(&bytes[..40]),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_status_rejected() {
        let mut bytes = CommunicationPacket::response_to(
            PacketId::random(),
            ResponsePacket::status(StatusCode::Ok),
        )
        .encode()
        .unwrap()
        .to_vec();
        bytes[34] = 42;
        assert!(CommunicationPacket::decode(&bytes).is_err());
    }
}
