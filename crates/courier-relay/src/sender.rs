//! Background forwarding of queued relay packets

use std::sync::Arc;

use courier_core::{CommunicationPacket, StatusCode, Timestamp};
use courier_transport::{PacketBatch, SendQueue};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::RelayConfig;
use crate::error::Result;
use crate::queue::{QueuedRelay, RelayQueue};

enum Forwarded {
    Delivered,
    Undeliverable,
    Retry,
}

/// Sends due [`RelayQueue`] entries to their next hop.
///
/// An entry leaves the queue once the next hop answers or once it is older
/// than `max_age`. Unanswered entries stay queued for the next pass.
pub struct RelaySender {
    queue: RelayQueue,
    send_queue: Arc<SendQueue>,
    config: RelayConfig,
}

impl RelaySender {
    /// Sender draining `queue` through `send_queue`
    pub fn new(queue: RelayQueue, send_queue: Arc<SendQueue>, config: RelayConfig) -> Self {
        Self {
            queue,
            send_queue,
            config,
        }
    }

    /// One pass: expire old entries, then forward everything due.
    /// Returns the number of packets the next hop confirmed.
    #[instrument(skip_all)]
    pub async fn send_due(&self) -> Result<usize> {
        let now = Timestamp::now();
        let queue = self.queue.clone();
        let max_age = self.config.max_age();
        let (expired, due) = tokio::task::spawn_blocking(move || -> Result<_> {
            let expired = queue.expire(max_age, now)?;
            Ok((expired, queue.due(now)?))
        })
        .await??;

        if expired > 0 {
            info!("Dropped {} relay packets past their maximum age", expired);
        }
        if due.is_empty() {
            return Ok(0);
        }

        debug!("Forwarding {} relay packets", due.len());
        let results = join_all(due.into_iter().map(|entry| self.forward(entry))).await;

        let mut delivered = 0;
        for (id, outcome) in results {
            match outcome {
                Forwarded::Delivered => delivered += 1,
                Forwarded::Undeliverable => {}
                Forwarded::Retry => continue,
            }
            if let Err(e) = self.queue.remove(&id) {
                warn!("Could not remove relay packet {}: {}", id, e);
            }
        }
        Ok(delivered)
    }

    async fn forward(&self, entry: QueuedRelay) -> (String, Forwarded) {
        let packet = match CommunicationPacket::decode(&entry.packet) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Discarding undecodable relay packet {}: {}", entry.id, e);
                return (entry.id, Forwarded::Undeliverable);
            }
        };

        let batch = Arc::new(PacketBatch::new());
        batch.put_packet(packet, entry.destination.clone());
        self.send_queue.send_batch(&batch);
        if !batch.await_first_reply(self.config.send_timeout()).await {
            debug!("No answer from {} for {}", entry.destination, entry.id);
            return (entry.id, Forwarded::Retry);
        }

        if let Some((_, response)) = batch.response_packets().into_iter().next() {
            if response.status != StatusCode::Ok {
                warn!(
                    "Next hop {} refused relay packet {}: {:?}",
                    entry.destination, entry.id, response.status
                );
            }
        }
        (entry.id, Forwarded::Delivered)
    }

    /// Run [`send_due`](Self::send_due) every `send_interval`
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.send_interval());
            loop {
                interval.tick().await;
                match self.send_due().await {
                    Ok(0) => {}
                    Ok(sent) => info!("Forwarded {} relay packets", sent),
                    Err(e) => warn!("Relay send pass failed: {}", e),
                }
            }
        })
    }
}
