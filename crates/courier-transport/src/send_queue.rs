//! Outbound packets and response routing

use std::sync::{Arc, Weak};

use courier_core::{CommunicationBody, CommunicationPacket, PeerIdentity, Timestamp};
use dashmap::DashMap;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::batch::PacketBatch;
use crate::error::Result;
use crate::transport::{DatagramTransport, PacketListener};

/// Sends packets through a [`DatagramTransport`] and hands responses to the
/// batch that is waiting for them.
///
/// Batches are tracked through weak references: once a caller drops its
/// batch, late responses for it are discarded.
pub struct SendQueue {
    transport: Arc<dyn DatagramTransport>,
    batches: DashMap<Uuid, Weak<PacketBatch>>,
}

impl SendQueue {
    /// Create a send queue over `transport`
    pub fn new(transport: Arc<dyn DatagramTransport>) -> Self {
        Self {
            transport,
            batches: DashMap::new(),
        }
    }

    /// Identity of the local node
    pub fn local_identity(&self) -> PeerIdentity {
        self.transport.local_identity()
    }

    /// Encode and send a single packet
    pub async fn send(&self, packet: &CommunicationPacket, destination: &PeerIdentity) -> Result<()> {
        let bytes = packet.encode()?;
        trace!(
            "Sending {} {} to {}",
            packet.body.kind(),
            packet.packet_id,
            destination
        );
        self.transport.send_datagram(destination, bytes).await
    }

    /// Register `batch` for response routing and send all of its packets
    /// concurrently. Returns immediately; use the batch latches to wait.
    pub fn send_batch(&self, batch: &Arc<PacketBatch>) {
        self.prune();
        self.batches.insert(batch.id(), Arc::downgrade(batch));

        for (packet, destination) in batch.outgoing() {
            let transport = self.transport.clone();
            let batch = batch.clone();
            tokio::spawn(async move {
                let result = match packet.encode() {
                    Ok(bytes) => transport.send_datagram(&destination, bytes).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = result {
                    debug!("Failed to send {} to {}: {}", packet.body.kind(), destination, e);
                }
                batch.mark_sent();
            });
        }
    }

    /// Number of batches still referenced by a caller
    pub fn active_batches(&self) -> usize {
        self.prune();
        self.batches.len()
    }

    fn prune(&self) {
        self.batches.retain(|_, batch| batch.strong_count() > 0);
    }

    fn route_response(&self, packet: &CommunicationPacket, sender: &PeerIdentity) {
        let live: Vec<Arc<PacketBatch>> = self
            .batches
            .iter()
            .filter_map(|e| e.value().upgrade())
            .collect();

        match live.iter().find(|b| b.contains(&packet.packet_id)) {
            Some(batch) => {
                batch.add_response(sender, packet.clone());
            }
            None => trace!(
                "No batch waiting for response {} from {}",
                packet.packet_id,
                sender
            ),
        }
    }
}

impl PacketListener for SendQueue {
    fn packet_received(
        &self,
        packet: &CommunicationPacket,
        sender: &PeerIdentity,
        _received_at: Timestamp,
    ) {
        if let CommunicationBody::Response(_) = packet.body {
            self.route_response(packet, sender);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use courier_core::{FindClosePeers, Hash256, ResponsePacket, StatusCode};
    use std::time::Duration;

    #[tokio::test]
    async fn test_batch_send_and_route() {
        let network = MemoryNetwork::new();
        let (local, _local_rx) = network.join(PeerIdentity::random());
        let remote_id = PeerIdentity::random();
        let (_remote, mut remote_rx) = network.join(remote_id.clone());

        let queue = SendQueue::new(local);
        let batch = Arc::new(PacketBatch::new());
        let request = CommunicationPacket::new(FindClosePeers {
            key: Hash256::random(),
        });
        batch.put_packet(request.clone(), remote_id.clone());
        queue.send_batch(&batch);
        batch.await_send_completion().await;

        let inbound = remote_rx.recv().await.unwrap();
        let received = CommunicationPacket::decode(&inbound.bytes).unwrap();
        assert_eq!(received.packet_id, request.packet_id);

        let reply = CommunicationPacket::response_to(
            request.packet_id,
            ResponsePacket::status(StatusCode::Ok),
        );
        queue.packet_received(&reply, &remote_id, Timestamp::now());
        assert!(batch.await_first_reply(Duration::from_secs(1)).await);
        assert_eq!(batch.response_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_batch_is_forgotten() {
        let network = MemoryNetwork::new();
        let (local, _rx) = network.join(PeerIdentity::random());
        let queue = SendQueue::new(local);

        let batch = Arc::new(PacketBatch::new());
        let request = CommunicationPacket::new(FindClosePeers {
            key: Hash256::random(),
        });
        let dest = PeerIdentity::random();
        batch.put_packet(request.clone(), dest.clone());
        queue.send_batch(&batch);
        batch.await_send_completion().await;
        drop(batch);

        // late response is ignored without panicking
        let reply = CommunicationPacket::response_to(
            request.packet_id,
            ResponsePacket::status(StatusCode::Ok),
        );
        queue.packet_received(&reply, &dest, Timestamp::now());
        assert_eq!(queue.active_batches(), 0);
    }
}
