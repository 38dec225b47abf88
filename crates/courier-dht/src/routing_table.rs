//! Kademlia routing table: 256 k-buckets plus one sibling bucket
//!
//! A peer lives in exactly one place. The sibling bucket holds the peers
//! closest to the local id regardless of prefix; everybody else sits in the
//! k-bucket indexed by the length of the prefix it shares with the local id.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{DhtKey, Hash256, PeerId, PeerIdentity, Timestamp};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::bucket::{Bucket, InsertOutcome};
use crate::peer::DhtPeer;

/// Number of k-buckets, one per possible shared-prefix length
pub const BUCKET_COUNT: usize = 256;

/// Routing table statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingTableStats {
    /// Peers across all buckets
    pub total_peers: usize,
    /// Peers in the sibling bucket
    pub sibling_peers: usize,
    /// Non-empty k-buckets
    pub buckets_used: usize,
    /// Peers currently locked by backoff
    pub locked_peers: usize,
}

/// Peer container answering "closest peers to X".
///
/// Mutations are serialized by an internal lock; readers work on bucket
/// snapshots and may observe a slightly stale table.
pub struct RoutingTable {
    local: PeerIdentity,
    local_id: PeerId,
    buckets: Vec<Bucket>,
    siblings: Bucket,
    write_lock: Mutex<()>,
}

impl RoutingTable {
    /// Empty table for the node `local`
    pub fn new(local: PeerIdentity, k: usize, s: usize) -> Self {
        Self {
            local_id: local.id(),
            local,
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::new(k)).collect(),
            siblings: Bucket::new(s),
            write_lock: Mutex::new(()),
        }
    }

    /// Local node identity
    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local
    }

    /// Local routing id
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// k-bucket index for `id`: the length of the prefix it shares with the
    /// local id. `None` for the local id itself.
    pub fn bucket_index(&self, id: &PeerId) -> Option<usize> {
        let prefix = self.local_id.shared_prefix_len(id);
        (prefix < BUCKET_COUNT).then_some(prefix)
    }

    /// The k-bucket at `index`
    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index)
    }

    /// The sibling bucket
    pub fn siblings(&self) -> &Bucket {
        &self.siblings
    }

    /// Insert a newly seen peer or refresh a known one
    pub fn insert_or_refresh(&self, identity: &PeerIdentity, now: Timestamp) -> InsertOutcome {
        let index = match self.bucket_index(&identity.id()) {
            Some(index) if identity != &self.local => index,
            _ => return InsertOutcome::Rejected,
        };

        let _guard = self.write_lock.lock();

        if let Some(existing) = self.siblings.get(identity) {
            return self.siblings.add_or_refresh(existing, now);
        }
        if let Some(existing) = self.buckets[index].get(identity) {
            return self.buckets[index].add_or_refresh(existing, now);
        }

        let peer = Arc::new(DhtPeer::new(identity.clone(), now));

        if !self.siblings.is_full() {
            trace!("Peer {} added to sibling bucket", identity);
            return self.siblings.add_or_refresh(peer, now);
        }

        let distance = self.local_id.distance(&peer.id());
        let farthest = self
            .siblings
            .snapshot()
            .iter()
            .max_by_key(|p| self.local_id.distance(&p.id()))
            .cloned();

        match farthest {
            Some(farthest) if distance < self.local_id.distance(&farthest.id()) => {
                self.siblings.remove(farthest.identity());
                self.siblings.add_or_refresh(peer, now);
                self.demote(farthest, now);
                InsertOutcome::Inserted
            }
            _ => self.buckets[index].add_or_refresh(peer, now),
        }
    }

    /// Move a former sibling into its k-bucket, subject to the k-bucket policy
    fn demote(&self, peer: Arc<DhtPeer>, now: Timestamp) {
        let Some(index) = self.bucket_index(&peer.id()) else {
            return;
        };
        let identity = peer.identity().clone();
        match self.buckets[index].add_or_refresh(peer, now) {
            InsertOutcome::Rejected => debug!("Demoted sibling {} dropped, bucket {} full", identity, index),
            _ => trace!("Sibling {} demoted to bucket {}", identity, index),
        }
    }

    /// Remove a peer. When a sibling leaves, the closest k-bucket peer is
    /// promoted to take its place.
    pub fn remove(&self, identity: &PeerIdentity) -> Option<Arc<DhtPeer>> {
        let _guard = self.write_lock.lock();

        if let Some(removed) = self.siblings.remove(identity) {
            let closest = self
                .buckets
                .iter()
                .flat_map(|b| b.snapshot().iter().cloned().collect::<Vec<_>>())
                .min_by_key(|p| self.local_id.distance(&p.id()));
            if let Some(promoted) = closest {
                if let Some(index) = self.bucket_index(&promoted.id()) {
                    self.buckets[index].remove(promoted.identity());
                }
                let now = promoted.last_seen();
                self.siblings.add_or_refresh(promoted, now);
            }
            return Some(removed);
        }

        let index = self.bucket_index(&identity.id())?;
        self.buckets[index].remove(identity)
    }

    /// The peer for `identity`
    pub fn get(&self, identity: &PeerIdentity) -> Option<Arc<DhtPeer>> {
        if let Some(peer) = self.siblings.get(identity) {
            return Some(peer);
        }
        let index = self.bucket_index(&identity.id())?;
        self.buckets[index].get(identity)
    }

    /// Whether `identity` is known
    pub fn contains(&self, identity: &PeerIdentity) -> bool {
        self.get(identity).is_some()
    }

    /// Up to `count` unlocked peers closest to `key`, ordered by XOR
    /// distance with ties going to the most recently seen peer
    pub fn get_closest(&self, key: &DhtKey, count: usize, now: Timestamp) -> Vec<Arc<DhtPeer>> {
        let mut candidates: Vec<Arc<DhtPeer>> = self
            .all_peers()
            .into_iter()
            .filter(|p| !p.is_locked(now))
            .collect();

        candidates.sort_by(|a, b| {
            key.distance(&a.id())
                .cmp(&key.distance(&b.id()))
                .then_with(|| b.last_seen().cmp(&a.last_seen()))
        });
        candidates.truncate(count);
        candidates
    }

    /// Every known peer, siblings first
    pub fn all_peers(&self) -> Vec<Arc<DhtPeer>> {
        let mut peers: Vec<Arc<DhtPeer>> = self.siblings.snapshot().as_ref().clone();
        for bucket in &self.buckets {
            peers.extend(bucket.snapshot().iter().cloned());
        }
        peers
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.siblings.len() + self.buckets.iter().map(|b| b.len()).sum::<usize>()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of non-empty k-buckets not refreshed within `threshold`
    pub fn stale_buckets(&self, threshold: Duration, now: Timestamp) -> Vec<usize> {
        let cutoff = now.minus(threshold);
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty() && b.last_refreshed() < cutoff)
            .map(|(i, _)| i)
            .collect()
    }

    /// Random lookup target falling into k-bucket `index`
    pub fn refresh_target(&self, index: usize) -> Hash256 {
        Hash256::random_with_prefix(&self.local_id, index)
    }

    /// Mark k-bucket `index` as refreshed
    pub fn mark_refreshed(&self, index: usize, now: Timestamp) {
        if let Some(bucket) = self.buckets.get(index) {
            bucket.mark_refreshed(now);
        }
    }

    /// Routing table statistics
    pub fn stats(&self, now: Timestamp) -> RoutingTableStats {
        let all = self.all_peers();
        RoutingTableStats {
            total_peers: all.len(),
            sibling_peers: self.siblings.len(),
            buckets_used: self.buckets.iter().filter(|b| !b.is_empty()).count(),
            locked_peers: all.iter().filter(|p| p.is_locked(now)).count(),
        }
    }
}
