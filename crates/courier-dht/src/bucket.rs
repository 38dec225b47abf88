//! Copy-on-write peer buckets
//!
//! A bucket keeps its peers ordered by recency: index 0 is the least
//! recently seen peer, the last index the most recent. Every mutation
//! builds a new list and swaps it in, so readers holding a
//! [`snapshot`](Bucket::snapshot) never block and never see a half-applied
//! change.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use courier_core::{PeerIdentity, Timestamp};
use parking_lot::RwLock;

use crate::peer::DhtPeer;

/// Immutable view of a bucket's peers
pub type PeerSnapshot = Arc<Vec<Arc<DhtPeer>>>;

/// Result of [`Bucket::add_or_refresh`]
#[derive(Debug)]
pub enum InsertOutcome {
    /// Peer was added
    Inserted,
    /// Peer was already present and moved to the most recent position
    Refreshed,
    /// Bucket was full; the returned locked peer was evicted to make room
    Replaced(Arc<DhtPeer>),
    /// Bucket was full of responsive peers; the newcomer was not added
    Rejected,
}

impl InsertOutcome {
    /// Whether the peer is in the bucket afterwards
    pub fn is_present(&self) -> bool {
        !matches!(self, InsertOutcome::Rejected)
    }
}

/// Bounded, recency-ordered peer list
#[derive(Debug)]
pub struct Bucket {
    capacity: usize,
    peers: RwLock<PeerSnapshot>,
    last_refreshed: AtomicI64,
}

impl Bucket {
    /// Empty bucket holding at most `capacity` peers
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            peers: RwLock::new(Arc::new(Vec::new())),
            last_refreshed: AtomicI64::new(0),
        }
    }

    /// Maximum number of peers
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current peers, least recently seen first
    pub fn snapshot(&self) -> PeerSnapshot {
        self.peers.read().clone()
    }

    /// Number of peers
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether the bucket is empty
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Whether the bucket is at capacity
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Whether `identity` is in the bucket
    pub fn contains(&self, identity: &PeerIdentity) -> bool {
        self.peers.read().iter().any(|p| p.identity() == identity)
    }

    /// The peer for `identity`
    pub fn get(&self, identity: &PeerIdentity) -> Option<Arc<DhtPeer>> {
        self.peers
            .read()
            .iter()
            .find(|p| p.identity() == identity)
            .cloned()
    }

    /// When the bucket last gained or refreshed a peer, or was explicitly
    /// refreshed by a lookup
    pub fn last_refreshed(&self) -> Timestamp {
        Timestamp::from_millis(self.last_refreshed.load(Ordering::Acquire))
    }

    /// Mark the bucket as refreshed at `now`
    pub fn mark_refreshed(&self, now: Timestamp) {
        self.last_refreshed
            .fetch_max(now.as_millis(), Ordering::AcqRel);
    }

    /// Add `peer`, or move it to the most recent position if present.
    ///
    /// When the bucket is full the least recently seen peer is evicted if it
    /// is locked at `now`; otherwise the newcomer is rejected.
    pub fn add_or_refresh(&self, peer: Arc<DhtPeer>, now: Timestamp) -> InsertOutcome {
        let mut guard = self.peers.write();
        let mut peers: Vec<Arc<DhtPeer>> = guard.as_ref().clone();

        let outcome = if let Some(pos) = peers.iter().position(|p| p.identity() == peer.identity())
        {
            let existing = peers.remove(pos);
            existing.touch(now);
            peers.push(existing);
            InsertOutcome::Refreshed
        } else if peers.len() < self.capacity {
            peers.push(peer);
            InsertOutcome::Inserted
        } else if peers.first().map(|p| p.is_locked(now)).unwrap_or(false) {
            let evicted = peers.remove(0);
            peers.push(peer);
            InsertOutcome::Replaced(evicted)
        } else {
            return InsertOutcome::Rejected;
        };

        *guard = Arc::new(peers);
        drop(guard);
        self.mark_refreshed(now);
        outcome
    }

    /// Remove the peer for `identity`
    pub fn remove(&self, identity: &PeerIdentity) -> Option<Arc<DhtPeer>> {
        let mut guard = self.peers.write();
        let pos = guard.iter().position(|p| p.identity() == identity)?;
        let mut peers: Vec<Arc<DhtPeer>> = guard.as_ref().clone();
        let removed = peers.remove(pos);
        *guard = Arc::new(peers);
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(now: Timestamp) -> Arc<DhtPeer> {
        Arc::new(DhtPeer::new(PeerIdentity::random(), now))
    }

    #[test]
    fn test_refresh_moves_to_most_recent() {
        let now = Timestamp::from_secs(100);
        let bucket = Bucket::new(4);
        let a = peer(now);
        let b = peer(now);
        bucket.add_or_refresh(a.clone(), now);
        bucket.add_or_refresh(b.clone(), now);

        let outcome = bucket.add_or_refresh(a.clone(), now);
        assert!(matches!(outcome, InsertOutcome::Refreshed));
        assert_eq!(bucket.len(), 2);
        let snapshot = bucket.snapshot();
        assert_eq!(snapshot[0].identity(), b.identity());
        assert_eq!(snapshot[1].identity(), a.identity());
    }

    #[test]
    fn test_full_bucket_rejects_when_oldest_responsive() {
        let now = Timestamp::from_secs(100);
        let bucket = Bucket::new(2);
        bucket.add_or_refresh(peer(now), now);
        bucket.add_or_refresh(peer(now), now);
        assert!(matches!(
            bucket.add_or_refresh(peer(now), now),
            InsertOutcome::Rejected
        ));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn test_full_bucket_evicts_locked_oldest() {
        let now = Timestamp::from_secs(100);
        let bucket = Bucket::new(2);
        let oldest = peer(now);
        bucket.add_or_refresh(oldest.clone(), now);
        bucket.add_or_refresh(peer(now), now);
        oldest.no_response(now);

        let newcomer = peer(now);
        match bucket.add_or_refresh(newcomer.clone(), now) {
            InsertOutcome::Replaced(evicted) => assert_eq!(evicted.identity(), oldest.identity()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(bucket.contains(newcomer.identity()));
        assert!(!bucket.contains(oldest.identity()));
    }

    #[test]
    fn test_snapshot_unaffected_by_later_mutation() {
        let now = Timestamp::from_secs(100);
        let bucket = Bucket::new(4);
        let a = peer(now);
        bucket.add_or_refresh(a.clone(), now);
        let snapshot = bucket.snapshot();
        bucket.remove(a.identity());
        assert_eq!(snapshot.len(), 1);
        assert!(bucket.is_empty());
    }
}
