//! Inbound datagram decoding and listener fan-out

use std::sync::Arc;

use courier_core::{peek_header, CommunicationPacket, PeerIdentity, Timestamp};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::ban_list::BanList;
use crate::transport::{InboundDatagram, PacketListener};

/// Decodes inbound datagrams and hands them to every registered listener.
///
/// Before decoding, the declared protocol version is fed to the
/// [`BanList`]; packets from banned peers are dropped, as are datagrams
/// that fail to decode.
pub struct PacketDispatcher {
    ban_list: Arc<BanList>,
    listeners: RwLock<Vec<Arc<dyn PacketListener>>>,
}

impl PacketDispatcher {
    /// Create a dispatcher sharing `ban_list`
    pub fn new(ban_list: Arc<BanList>) -> Self {
        Self {
            ban_list,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Ban list consulted by this dispatcher
    pub fn ban_list(&self) -> &Arc<BanList> {
        &self.ban_list
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn PacketListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Decode one datagram and deliver it
    pub fn dispatch(&self, bytes: &[u8], sender: &PeerIdentity, received_at: Timestamp) {
        let (tag, version) = match peek_header(bytes) {
            Ok(header) => header,
            Err(e) => {
                debug!("Dropping short datagram from {}: {}", sender, e);
                return;
            }
        };

        self.ban_list.update(sender, version);
        if self.ban_list.is_banned(sender) {
            debug!(
                "Dropping packet type {:?} from banned peer {}",
                tag as char, sender
            );
            return;
        }

        let packet = match CommunicationPacket::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping malformed packet from {}: {}", sender, e);
                return;
            }
        };

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.packet_received(&packet, sender, received_at);
        }
    }

    /// Dispatch datagrams until the inbound channel closes
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundDatagram>) {
        while let Some(datagram) = inbound.recv().await {
            self.dispatch(&datagram.bytes, &datagram.sender, datagram.received_at);
        }
        info!("Inbound channel closed, dispatcher stopped");
    }
}
