//! In-process network for simulations and tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{PeerIdentity, Timestamp, MAX_DATAGRAM_SIZE};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::transport::{DatagramTransport, InboundDatagram};
use crate::INBOUND_CHANNEL_CAPACITY;

struct Endpoint {
    inbox: mpsc::Sender<InboundDatagram>,
    online: Arc<AtomicBool>,
}

/// Hub connecting [`MemoryTransport`]s by identity.
///
/// Nodes can be switched offline to simulate unreachable peers: an offline
/// node neither sends nor receives, and datagrams addressed to it vanish.
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: DashMap<PeerIdentity, Endpoint>,
}

impl MemoryNetwork {
    /// Empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node. Returns its transport and the receiver for its
    /// inbound datagrams.
    pub fn join(
        self: &Arc<Self>,
        identity: PeerIdentity,
    ) -> (Arc<MemoryTransport>, mpsc::Receiver<InboundDatagram>) {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let online = Arc::new(AtomicBool::new(true));
        self.endpoints.insert(
            identity.clone(),
            Endpoint {
                inbox: tx,
                online: online.clone(),
            },
        );
        let transport = Arc::new(MemoryTransport {
            network: self.clone(),
            identity,
            online,
        });
        (transport, rx)
    }

    /// Detach a node
    pub fn leave(&self, identity: &PeerIdentity) {
        self.endpoints.remove(identity);
    }

    /// Switch a node on or off
    pub fn set_online(&self, identity: &PeerIdentity, online: bool) {
        if let Some(endpoint) = self.endpoints.get(identity) {
            endpoint.online.store(online, Ordering::SeqCst);
        }
    }

    /// Number of attached nodes
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether no node is attached
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    fn deliver(&self, sender: &PeerIdentity, destination: &PeerIdentity, bytes: Bytes) -> Result<()> {
        let inbox = match self.endpoints.get(destination) {
            Some(endpoint) => {
                if !endpoint.online.load(Ordering::SeqCst) {
                    trace!("Dropping datagram for offline node {}", destination);
                    return Ok(());
                }
                endpoint.inbox.clone()
            }
            None => return Err(TransportError::Unreachable(destination.to_string())),
        };

        let datagram = InboundDatagram {
            sender: sender.clone(),
            bytes,
            received_at: Timestamp::now(),
        };
        if inbox.try_send(datagram).is_err() {
            trace!("Inbox of {} full or closed, datagram lost", destination);
        }
        Ok(())
    }
}

/// One node's view of a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    identity: PeerIdentity,
    online: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Whether this node is online
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatagramTransport for MemoryTransport {
    async fn send_datagram(&self, destination: &PeerIdentity, datagram: Bytes) -> Result<()> {
        if !self.is_online() {
            return Err(TransportError::Offline);
        }
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::Packet(format!(
                "datagram of {} bytes exceeds {}",
                datagram.len(),
                MAX_DATAGRAM_SIZE
            )));
        }
        self.network.deliver(&self.identity, destination, datagram)
    }

    fn local_identity(&self) -> PeerIdentity {
        self.identity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery() {
        let network = MemoryNetwork::new();
        let a = PeerIdentity::random();
        let b = PeerIdentity::random();
        let (ta, _ra) = network.join(a.clone());
        let (_tb, mut rb) = network.join(b.clone());

        ta.send_datagram(&b, Bytes::from_static(b"hello")).await.unwrap();
        let datagram = rb.recv().await.unwrap();
        assert_eq!(datagram.sender, a);
        assert_eq!(&datagram.bytes[..], b"hello");
    }

    #[tokio::test]
    async fn test_offline_node_receives_nothing() {
        let network = MemoryNetwork::new();
        let a = PeerIdentity::random();
        let b = PeerIdentity::random();
        let (ta, _ra) = network.join(a.clone());
        let (tb, mut rb) = network.join(b.clone());

        network.set_online(&b, false);
        ta.send_datagram(&b, Bytes::from_static(b"lost")).await.unwrap();
        assert!(rb.try_recv().is_err());
        assert!(matches!(
            tb.send_datagram(&a, Bytes::from_static(b"x")).await,
            Err(TransportError::Offline)
        ));
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let network = MemoryNetwork::new();
        let (ta, _ra) = network.join(PeerIdentity::random());
        assert!(matches!(
            ta.send_datagram(&PeerIdentity::random(), Bytes::new()).await,
            Err(TransportError::Unreachable(_))
        ));
    }
}
