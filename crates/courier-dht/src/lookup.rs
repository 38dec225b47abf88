//! Iterative closest-peer lookup
//!
//! Each round sends one [`PacketBatch`] of `FindClosePeers` requests to the
//! closest candidates not asked yet, then merges the returned peer lists.
//! The lookup ends when a round brings no closer peer (after one finishing
//! round over the unqueried top K), when candidates run out, or when the
//! round or time ceiling is hit. Only peers that answered are returned.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{
    CommunicationPacket, DataPacket, DhtKey, Distance, FindClosePeers, PeerIdentity, Timestamp,
};
use courier_transport::{BanList, PacketBatch, SendQueue};
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

use crate::config::DhtConfig;
use crate::routing_table::RoutingTable;

/// Limits for one lookup, taken from [`DhtConfig`]
#[derive(Clone, Copy, Debug)]
pub struct LookupParams {
    /// Peers returned
    pub k: usize,
    /// Peers queried per round
    pub alpha: usize,
    /// Round ceiling
    pub max_rounds: usize,
    /// Wait per round
    pub response_timeout: Duration,
    /// Wait for the whole lookup
    pub lookup_timeout: Duration,
}

impl From<&DhtConfig> for LookupParams {
    fn from(config: &DhtConfig) -> Self {
        Self {
            k: config.k_bucket_size,
            alpha: config.alpha,
            max_rounds: config.max_lookup_rounds,
            response_timeout: config.response_timeout(),
            lookup_timeout: config.lookup_timeout(),
        }
    }
}

/// One closest-peer search for `key`
pub struct ClosestPeersLookup {
    key: DhtKey,
    params: LookupParams,
    table: Arc<RoutingTable>,
    queue: Arc<SendQueue>,
    bans: Arc<BanList>,
    candidates: BTreeMap<Distance, PeerIdentity>,
    queried: HashSet<PeerIdentity>,
    responded: BTreeMap<Distance, PeerIdentity>,
}

impl ClosestPeersLookup {
    /// Prepare a lookup seeded from the routing table
    pub fn new(
        key: DhtKey,
        params: LookupParams,
        table: Arc<RoutingTable>,
        queue: Arc<SendQueue>,
        bans: Arc<BanList>,
    ) -> Self {
        let mut lookup = Self {
            key,
            params,
            table,
            queue,
            bans,
            candidates: BTreeMap::new(),
            queried: HashSet::new(),
            responded: BTreeMap::new(),
        };
        let now = Timestamp::now();
        let seeds = lookup.table.get_closest(&key, params.k, now);
        for peer in seeds {
            lookup.add_candidate(peer.identity(), now);
        }
        lookup
    }

    /// Locked peers stay out until their lock expires, even when another
    /// peer names them.
    fn add_candidate(&mut self, identity: &PeerIdentity, now: Timestamp) -> bool {
        if identity == self.table.local_identity()
            || self.queried.contains(identity)
            || self.bans.is_banned(identity)
            || self.table.get(identity).is_some_and(|p| p.is_locked(now))
        {
            return false;
        }
        let distance = self.key.distance(&identity.id());
        if self.candidates.contains_key(&distance) {
            return false;
        }
        self.candidates.insert(distance, identity.clone());
        true
    }

    fn next_targets(&self, finishing: bool) -> Vec<PeerIdentity> {
        let unqueried = |p: &&PeerIdentity| !self.queried.contains(*p);
        if finishing {
            self.candidates
                .values()
                .take(self.params.k)
                .filter(unqueried)
                .cloned()
                .collect()
        } else {
            self.candidates
                .values()
                .filter(unqueried)
                .take(self.params.alpha)
                .cloned()
                .collect()
        }
    }

    /// Run the lookup. Returns up to K responsive peers, closest first;
    /// an unreachable network yields an empty list.
    #[instrument(skip_all, fields(key = %self.key))]
    pub async fn run(mut self) -> Vec<PeerIdentity> {
        let started = Instant::now();
        let mut best = self.candidates.keys().next().copied();
        let mut finishing = false;
        let mut rounds = 0;

        while rounds < self.params.max_rounds {
            let elapsed = started.elapsed();
            if elapsed >= self.params.lookup_timeout {
                debug!("Lookup timed out after {} rounds", rounds);
                break;
            }

            let targets = self.next_targets(finishing);
            if targets.is_empty() {
                break;
            }
            rounds += 1;

            let wait = self
                .params
                .response_timeout
                .min(self.params.lookup_timeout - elapsed);
            let learned = self.query_round(&targets, wait).await;
            trace!(
                "Round {}: asked {}, learned {} new peers",
                rounds,
                targets.len(),
                learned
            );

            let closest = self.candidates.keys().next().copied();
            let improved = match (closest, best) {
                (Some(c), Some(b)) => c < b,
                (Some(_), None) => true,
                _ => false,
            };
            if improved {
                best = closest;
                finishing = false;
            } else if finishing {
                break;
            } else {
                finishing = true;
            }
        }

        let found: Vec<PeerIdentity> = self
            .responded
            .into_values()
            .take(self.params.k)
            .collect();
        debug!("Lookup finished: {} peers in {} rounds", found.len(), rounds);
        found
    }

    /// Ask `targets` for their closest peers. Returns the number of new
    /// candidates learned.
    async fn query_round(&mut self, targets: &[PeerIdentity], wait: Duration) -> usize {
        let batch = Arc::new(PacketBatch::new());
        for target in targets {
            self.queried.insert(target.clone());
            let request = CommunicationPacket::new(FindClosePeers { key: self.key });
            batch.put_packet(request, target.clone());
        }
        self.queue.send_batch(&batch);
        batch.await_all_responses(wait).await;

        let responses = batch.responses();
        let now = Timestamp::now();
        let mut learned = 0;

        for target in targets {
            let distance = self.key.distance(&target.id());
            let peer = self.table.get(target);
            let Some(response) = responses.get(target).and_then(|p| p.as_response()) else {
                if let Some(peer) = peer {
                    peer.no_response(now);
                }
                self.candidates.remove(&distance);
                continue;
            };

            if let Some(peer) = peer {
                peer.response_received(now);
            }
            self.responded.insert(distance, target.clone());

            let Some(DataPacket::PeerList(list)) = &response.payload else {
                continue;
            };
            for identity in &list.peers {
                if self.add_candidate(identity, now) {
                    self.table.insert_or_refresh(identity, now);
                    learned += 1;
                }
            }
        }
        learned
    }
}
