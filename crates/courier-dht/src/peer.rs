//! Remote peer with liveness and backoff state
//!
//! A peer that misses a response is locked for `2^min(timeouts, 10)`
//! minutes. Locked peers stay in their bucket but are not picked as lookup
//! or store targets; the next response unlocks them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use courier_core::{PeerId, PeerIdentity, Timestamp};
use parking_lot::Mutex;

/// Number of request outcomes kept for the reachability estimate
pub const REACHABILITY_WINDOW: usize = 20;

/// Exponent cap for the lock duration (2^10 minutes, about 17 hours)
pub const MAX_BACKOFF_EXPONENT: u32 = 10;

const UNLOCKED: i64 = i64::MIN;

/// A remote node as seen by the routing table.
///
/// Shared as `Arc<DhtPeer>` between buckets, lookups and the receive path;
/// all mutable state is interior.
pub struct DhtPeer {
    identity: PeerIdentity,
    id: PeerId,
    first_seen: Timestamp,
    last_seen: AtomicI64,
    consecutive_timeouts: AtomicU32,
    locked_until: AtomicI64,
    samples: Mutex<VecDeque<bool>>,
}

impl DhtPeer {
    /// First contact with `identity`
    pub fn new(identity: PeerIdentity, now: Timestamp) -> Self {
        Self {
            id: identity.id(),
            identity,
            first_seen: now,
            last_seen: AtomicI64::new(now.as_millis()),
            consecutive_timeouts: AtomicU32::new(0),
            locked_until: AtomicI64::new(UNLOCKED),
            samples: Mutex::new(VecDeque::with_capacity(REACHABILITY_WINDOW)),
        }
    }

    /// Transport destination
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Routing id
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// When the peer was first seen
    pub fn first_seen(&self) -> Timestamp {
        self.first_seen
    }

    /// When the peer was last heard from
    pub fn last_seen(&self) -> Timestamp {
        Timestamp::from_millis(self.last_seen.load(Ordering::Acquire))
    }

    /// Record that a packet arrived from the peer
    pub fn touch(&self, now: Timestamp) {
        self.last_seen.fetch_max(now.as_millis(), Ordering::AcqRel);
    }

    /// Timeouts since the last response
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::Acquire)
    }

    /// End of the current lock, if any
    pub fn locked_until(&self) -> Option<Timestamp> {
        match self.locked_until.load(Ordering::Acquire) {
            UNLOCKED => None,
            millis => Some(Timestamp::from_millis(millis)),
        }
    }

    /// Lock duration after `timeouts` consecutive timeouts
    pub fn lock_duration(timeouts: u32) -> Duration {
        let minutes = 1u64 << timeouts.min(MAX_BACKOFF_EXPONENT);
        Duration::from_secs(minutes * 60)
    }

    /// A request to the peer timed out
    pub fn no_response(&self, now: Timestamp) {
        let timeouts = self
            .consecutive_timeouts
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        let until = now.plus(Self::lock_duration(timeouts));
        self.locked_until.store(until.as_millis(), Ordering::Release);
        self.record_sample(false);
    }

    /// The peer answered a request
    pub fn response_received(&self, now: Timestamp) {
        self.consecutive_timeouts.store(0, Ordering::Release);
        self.locked_until.store(UNLOCKED, Ordering::Release);
        self.record_sample(true);
        self.touch(now);
    }

    /// Whether the peer is excluded from target selection at `now`
    pub fn is_locked(&self, now: Timestamp) -> bool {
        self.locked_until()
            .map(|until| now < until)
            .unwrap_or(false)
    }

    /// Percentage of answered requests in the sample window, `None` before
    /// the first request
    pub fn reachability(&self) -> Option<u8> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let ok = samples.iter().filter(|s| **s).count();
        Some((ok * 100 / samples.len()) as u8)
    }

    fn record_sample(&self, success: bool) {
        let mut samples = self.samples.lock();
        if samples.len() == REACHABILITY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(success);
    }
}

impl fmt::Debug for DhtPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtPeer")
            .field("identity", &self.identity)
            .field("last_seen", &self.last_seen())
            .field("consecutive_timeouts", &self.consecutive_timeouts())
            .field("locked_until", &self.locked_until())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(DhtPeer::lock_duration(1), 2 * MINUTE);
        assert_eq!(DhtPeer::lock_duration(3), 8 * MINUTE);
        assert_eq!(DhtPeer::lock_duration(10), 1024 * MINUTE);
        assert_eq!(DhtPeer::lock_duration(25), 1024 * MINUTE);
    }

    #[test]
    fn test_three_timeouts_lock_for_eight_minutes() {
        let now = Timestamp::from_secs(1_000_000);
        let peer = DhtPeer::new(PeerIdentity::random(), now);
        for _ in 0..3 {
            peer.no_response(now);
        }
        assert_eq!(peer.consecutive_timeouts(), 3);
        assert!(peer.is_locked(now));
        assert!(peer.is_locked(now.plus(7 * MINUTE)));
        assert!(!peer.is_locked(now.plus(8 * MINUTE)));
    }

    #[test]
    fn test_response_clears_lock() {
        let now = Timestamp::from_secs(1_000);
        let peer = DhtPeer::new(PeerIdentity::random(), now);
        peer.no_response(now);
        assert!(peer.is_locked(now));

        let later = now.plus(Duration::from_secs(5));
        peer.response_received(later);
        assert!(!peer.is_locked(later));
        assert_eq!(peer.consecutive_timeouts(), 0);
        assert_eq!(peer.locked_until(), None);
        assert_eq!(peer.last_seen(), later);
    }

    #[test]
    fn test_reachability_window() {
        let now = Timestamp::from_secs(1);
        let peer = DhtPeer::new(PeerIdentity::random(), now);
        assert_eq!(peer.reachability(), None);

        for _ in 0..REACHABILITY_WINDOW {
            peer.no_response(now);
        }
        assert_eq!(peer.reachability(), Some(0));

        for _ in 0..REACHABILITY_WINDOW / 2 {
            peer.response_received(now);
        }
        assert_eq!(peer.reachability(), Some(50));
    }
}
