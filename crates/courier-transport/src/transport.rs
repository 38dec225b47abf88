//! Transport and listener seams

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{CommunicationPacket, PeerIdentity, Timestamp};

use crate::error::Result;

/// Outbound datagram primitive.
///
/// Delivery is best effort: `Ok` only means the datagram was handed to the
/// network. Inbound datagrams are delivered through the channel returned
/// when the transport is created.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram to `destination`
    async fn send_datagram(&self, destination: &PeerIdentity, datagram: Bytes) -> Result<()>;

    /// Identity other peers use to reach this node
    fn local_identity(&self) -> PeerIdentity;
}

/// A datagram received from the network
#[derive(Clone, Debug)]
pub struct InboundDatagram {
    /// Who sent it
    pub sender: PeerIdentity,
    /// Raw packet bytes
    pub bytes: Bytes,
    /// When it arrived
    pub received_at: Timestamp,
}

/// Callback for decoded inbound packets.
///
/// Called on the receive path, so implementations must return quickly and
/// spawn any storage or network work instead of awaiting it.
pub trait PacketListener: Send + Sync {
    /// A packet arrived from `sender`
    fn packet_received(
        &self,
        packet: &CommunicationPacket,
        sender: &PeerIdentity,
        received_at: Timestamp,
    );
}
