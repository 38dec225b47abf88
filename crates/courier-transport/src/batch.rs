//! Correlation of a set of outgoing requests with their responses
//!
//! A [`PacketBatch`] is filled with `(packet, destination)` pairs, handed to
//! [`SendQueue::send_batch`](crate::SendQueue::send_batch), and then awaited
//! through three independent latches:
//!
//! - send completion: every packet was handed to the transport
//! - first reply: at least one response arrived
//! - all responses: every destination answered
//!
//! Responses are keyed by sender and only accepted from the destination of
//! the request they answer; the first response per destination wins.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use courier_core::{CommunicationPacket, PacketId, PeerIdentity, ResponsePacket};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Upper bound for [`PacketBatch::await_send_completion`]
pub const SEND_COMPLETION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Polling granularity of [`PacketBatch::await_all_responses`]
pub const RESPONSE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Requests sent together and the responses they produced
#[derive(Debug)]
pub struct PacketBatch {
    id: Uuid,
    outgoing: DashMap<PacketId, (CommunicationPacket, PeerIdentity)>,
    incoming: DashMap<PeerIdentity, CommunicationPacket>,
    sent: watch::Sender<usize>,
    received: watch::Sender<usize>,
}

impl Default for PacketBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            outgoing: DashMap::new(),
            incoming: DashMap::new(),
            sent: watch::channel(0).0,
            received: watch::channel(0).0,
        }
    }

    /// Batch id, used by the send queue registry
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a request for `destination`. Must be called before the batch is
    /// submitted for sending.
    pub fn put_packet(&self, packet: CommunicationPacket, destination: PeerIdentity) {
        self.outgoing.insert(packet.packet_id, (packet, destination));
    }

    /// Outgoing packets and their destinations
    pub fn outgoing(&self) -> Vec<(CommunicationPacket, PeerIdentity)> {
        self.outgoing.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of outgoing packets
    pub fn len(&self) -> usize {
        self.outgoing.len()
    }

    /// Whether the batch has no outgoing packets
    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty()
    }

    /// Whether `packet_id` belongs to one of this batch's requests
    pub fn contains(&self, packet_id: &PacketId) -> bool {
        self.outgoing.contains_key(packet_id)
    }

    /// Distinct destinations
    pub fn destinations(&self) -> HashSet<PeerIdentity> {
        self.outgoing.iter().map(|e| e.value().1.clone()).collect()
    }

    /// Record a response from `sender`.
    ///
    /// Accepted only when the response's packet id names a request sent to
    /// `sender` and `sender` has not answered yet. Returns whether it was
    /// accepted.
    pub fn add_response(&self, sender: &PeerIdentity, packet: CommunicationPacket) -> bool {
        let expected = self
            .outgoing
            .get(&packet.packet_id)
            .map(|e| &e.value().1 == sender)
            .unwrap_or(false);
        if !expected {
            trace!(
                "Batch {} ignoring response {} from {}",
                self.id,
                packet.packet_id,
                sender
            );
            return false;
        }

        match self.incoming.entry(sender.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(packet);
            }
        }
        self.received.send_modify(|n| *n += 1);
        true
    }

    /// Count one packet as handed to the transport
    pub fn mark_sent(&self) {
        self.sent.send_modify(|n| *n += 1);
    }

    /// Number of packets handed to the transport so far
    pub fn sent_count(&self) -> usize {
        *self.sent.borrow()
    }

    /// Number of responses received
    pub fn response_count(&self) -> usize {
        self.incoming.len()
    }

    /// Responses keyed by sender
    pub fn responses(&self) -> HashMap<PeerIdentity, CommunicationPacket> {
        self.incoming
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Response bodies keyed by sender, skipping anything that is not a
    /// [`ResponsePacket`]
    pub fn response_packets(&self) -> Vec<(PeerIdentity, ResponsePacket)> {
        self.incoming
            .iter()
            .filter_map(|e| {
                e.value()
                    .as_response()
                    .map(|r| (e.key().clone(), r.clone()))
            })
            .collect()
    }

    /// Wait until every packet has been handed to the transport, at most
    /// five minutes. A timeout is logged, not returned.
    pub async fn await_send_completion(&self) {
        let total = self.outgoing.len();
        let mut rx = self.sent.subscribe();
        if timeout(SEND_COMPLETION_TIMEOUT, rx.wait_for(|n| *n >= total))
            .await
            .is_err()
        {
            warn!(
                "Batch {}: only {} of {} packets sent after {:?}",
                self.id,
                self.sent_count(),
                total,
                SEND_COMPLETION_TIMEOUT
            );
        }
    }

    /// Wait until at least one response arrived or `wait` elapsed.
    /// Returns whether a response arrived.
    pub async fn await_first_reply(&self, wait: Duration) -> bool {
        let mut rx = self.received.subscribe();
        let replied = matches!(timeout(wait, rx.wait_for(|n| *n >= 1)).await, Ok(Ok(_)));
        replied
    }

    /// Wait until at least `count` responses arrived or `wait` elapsed.
    /// Returns whether the count was reached.
    pub async fn await_responses(&self, count: usize, wait: Duration) -> bool {
        let mut rx = self.received.subscribe();
        let reached = matches!(timeout(wait, rx.wait_for(|n| *n >= count)).await, Ok(Ok(_)));
        reached
    }

    /// Wait until every destination answered or `wait` elapsed.
    ///
    /// Checks at least once per second and returns as soon as the batch is
    /// complete.
    pub async fn await_all_responses(&self, wait: Duration) {
        let deadline = Instant::now() + wait;
        let expected = self.destinations().len();
        let mut rx = self.received.subscribe();

        loop {
            if self.response_count() >= expected {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(
                    "Batch {}: {} of {} destinations answered",
                    self.id,
                    self.response_count(),
                    expected
                );
                return;
            }
            let step = (deadline - now).min(RESPONSE_POLL_INTERVAL);
            // Err means the step elapsed; the sender lives in self so the
            // channel cannot close while we wait.
            let _ = timeout(step, rx.changed()).await;
        }
    }
}
