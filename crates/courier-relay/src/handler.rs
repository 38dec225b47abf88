//! Inbound relay request handling

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_core::{
    CommunicationBody, CommunicationPacket, PeerIdentity, RelayRequest, ResponsePacket,
    StatusCode, Timestamp,
};
use courier_crypto::{CryptoError, HashcashStamp};
use courier_transport::{PacketDispatcher, PacketListener, SendQueue};
use tracing::{debug, instrument, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::queue::{schedule_send_time, RelayQueue};
use crate::worker::{PacketStore, StoreWorkerPool};

/// Answers relay requests and hands their payloads on.
///
/// The sender is told `OK` as soon as the request checks out, before the
/// payload is stored or forwarded. Nested relay requests go to the
/// [`RelayQueue`] with a randomized send time; store requests go to the
/// [`StoreWorkerPool`].
#[derive(Clone)]
pub struct RelayPacketHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    config: RelayConfig,
    queue: RelayQueue,
    send_queue: Arc<SendQueue>,
    workers: StoreWorkerPool,
}

impl RelayPacketHandler {
    /// Create the handler and start its store workers.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: RelayConfig,
        queue: RelayQueue,
        send_queue: Arc<SendQueue>,
        store: Arc<dyn PacketStore>,
    ) -> Result<Self> {
        config.validate().map_err(RelayError::Configuration)?;
        let workers =
            StoreWorkerPool::spawn(store, config.store_workers, config.store_queue_capacity);
        Ok(Self {
            inner: Arc::new(HandlerInner {
                config,
                queue,
                send_queue,
                workers,
            }),
        })
    }

    /// Subscribe to inbound packets
    pub fn register(&self, dispatcher: &PacketDispatcher) {
        dispatcher.add_listener(Arc::new(self.clone()));
    }

    /// Queue backing this handler
    pub fn queue(&self) -> &RelayQueue {
        &self.inner.queue
    }

    /// Check a request's stamp and decode its payload.
    ///
    /// On failure returns the status to answer with.
    pub fn check(
        &self,
        request: &RelayRequest,
    ) -> std::result::Result<CommunicationPacket, StatusCode> {
        let stamp =
            HashcashStamp::from_str(&request.stamp).map_err(|_| StatusCode::InvalidHashcash)?;
        let checked = stamp.verify(
            &request.resource(),
            self.inner.config.hashcash_bits,
            Utc::now().date_naive(),
            self.inner.config.hashcash_validity_days,
        );
        match checked {
            Ok(()) => {}
            Err(CryptoError::InsufficientWork { .. }) => {
                return Err(StatusCode::InsufficientHashcash)
            }
            Err(e) => {
                debug!("Rejecting relay stamp: {}", e);
                return Err(StatusCode::InvalidHashcash);
            }
        }

        let payload = request.payload_packet().map_err(|e| {
            debug!("Undecodable relay payload: {}", e);
            StatusCode::InvalidPacket
        })?;
        if matches!(
            payload.body,
            CommunicationBody::Store(_) | CommunicationBody::Relay(_)
        ) {
            Ok(payload)
        } else {
            debug!("Relay payload of unsupported kind {}", payload.body.kind());
            Err(StatusCode::InvalidPacket)
        }
    }
}

impl HandlerInner {
    #[instrument(skip_all, fields(from = %sender))]
    async fn process(
        &self,
        request: RelayRequest,
        payload: CommunicationPacket,
        sender: PeerIdentity,
    ) {
        match payload.body {
            CommunicationBody::Store(store) => {
                if self.workers.submit(store.packet) {
                    debug!("Submitted relayed store");
                }
            }
            CommunicationBody::Relay(_) => {
                let Some(next_hop) = request.next_hop else {
                    warn!("Dropping nested relay request without a next hop");
                    return;
                };
                let send_time = schedule_send_time(
                    Duration::from_millis(u64::from(request.delay_millis)),
                    self.config.max_delay(),
                    Timestamp::now(),
                );
                let queue = self.queue.clone();
                let bytes = request.payload;
                let queued = tokio::task::spawn_blocking(move || {
                    queue.enqueue(&next_hop, &bytes, send_time)
                })
                .await
                .map_err(RelayError::from)
                .and_then(|result| result);
                match queued {
                    Ok(id) => debug!("Queued {} until {}", id, send_time),
                    Err(e) => warn!("Could not queue relay packet: {}", e),
                }
            }
            _ => {}
        }
    }
}

impl PacketListener for RelayPacketHandler {
    fn packet_received(
        &self,
        packet: &CommunicationPacket,
        sender: &PeerIdentity,
        _received_at: Timestamp,
    ) {
        let CommunicationBody::Relay(request) = &packet.body else {
            return;
        };

        let checked = self.check(request);
        let status = match &checked {
            Ok(_) => StatusCode::Ok,
            Err(status) => *status,
        };

        let inner = self.inner.clone();
        let request = request.clone();
        let request_id = packet.packet_id;
        let sender = sender.clone();
        tokio::spawn(async move {
            let reply =
                CommunicationPacket::response_to(request_id, ResponsePacket::status(status));
            if let Err(e) = inner.send_queue.send(&reply, &sender).await {
                debug!("Could not answer relay request from {}: {}", sender, e);
            }
            if let Ok(payload) = checked {
                inner.process(request, payload, sender).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use courier_core::DhtStorablePacket;
    use courier_transport::{DatagramTransport, MemoryNetwork};
    use tempfile::tempdir;

    struct NullStore;

    #[async_trait]
    impl PacketStore for NullStore {
        async fn store_packet(&self, _packet: DhtStorablePacket) -> Result<()> {
            Ok(())
        }
    }

    fn relay_of(payload: Bytes, bits: u32) -> RelayRequest {
        RelayRequest {
            stamp: HashcashStamp::mint(&RelayRequest::resource_for(&payload), bits).to_string(),
            delay_millis: 0,
            next_hop: None,
            payload,
        }
    }

    #[tokio::test]
    async fn test_check_statuses() {
        let network = MemoryNetwork::new();
        let (transport, _inbound) = network.join(PeerIdentity::random());
        let send_queue = Arc::new(SendQueue::new(transport as Arc<dyn DatagramTransport>));
        let dir = tempdir().unwrap();
        let mut config = RelayConfig::with_queue_path(dir.path().to_string_lossy());
        config.hashcash_bits = 4;
        let handler = RelayPacketHandler::new(
            config,
            RelayQueue::open(dir.path()).unwrap(),
            send_queue,
            Arc::new(NullStore),
        )
        .unwrap();

        let inner = CommunicationPacket::new(relay_of(Bytes::from_static(b"x"), 0));
        let payload = inner.encode().unwrap();

        assert!(handler.check(&relay_of(payload.clone(), 4)).is_ok());
        assert_eq!(
            handler.check(&relay_of(payload.clone(), 0)).unwrap_err(),
            StatusCode::InsufficientHashcash
        );

        let mut bad_stamp = relay_of(payload.clone(), 4);
        bad_stamp.stamp = "garbage".to_string();
        assert_eq!(handler.check(&bad_stamp).unwrap_err(), StatusCode::InvalidHashcash);

        // stamp minted for a different payload
        let mut swapped = relay_of(payload, 4);
        swapped.payload = Bytes::from_static(b"other");
        assert_eq!(handler.check(&swapped).unwrap_err(), StatusCode::InvalidHashcash);

        let junk = Bytes::from_static(b"not a packet");
        assert_eq!(
            handler.check(&relay_of(junk, 4)).unwrap_err(),
            StatusCode::InvalidPacket
        );

        let lookup = CommunicationPacket::new(courier_core::FindClosePeers {
            key: courier_core::Hash256::random(),
        });
        assert_eq!(
            handler
                .check(&relay_of(lookup.encode().unwrap(), 4))
                .unwrap_err(),
            StatusCode::InvalidPacket
        );
    }
}
