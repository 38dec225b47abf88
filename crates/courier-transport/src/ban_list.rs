//! Peers excluded for protocol non-compliance

use std::fmt;

use courier_core::{is_version_compatible, PeerIdentity, Timestamp};
use dashmap::DashMap;
use tracing::{debug, info};

/// Why a peer was banned
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BanReason {
    /// Peer sent a packet with a protocol version below the minimum
    IncompatibleVersion(u8),
    /// Banned by an operator
    Manual(String),
}

impl fmt::Display for BanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BanReason::IncompatibleVersion(v) => write!(f, "incompatible protocol version {}", v),
            BanReason::Manual(reason) => write!(f, "{}", reason),
        }
    }
}

/// A banned peer
#[derive(Clone, Debug)]
pub struct BanEntry {
    /// The peer
    pub identity: PeerIdentity,
    /// Why it was banned
    pub reason: BanReason,
    /// When the ban started
    pub since: Timestamp,
}

/// Set of banned peers, shared through an `Arc` by the dispatcher and
/// every component that picks peers for outgoing requests
#[derive(Debug, Default)]
pub struct BanList {
    entries: DashMap<PeerIdentity, BanEntry>,
}

impl BanList {
    /// Empty ban list
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the version rule to a packet received from `peer`: an
    /// incompatible version bans the peer, a compatible one lifts a
    /// version ban. Manual bans are left alone.
    pub fn update(&self, peer: &PeerIdentity, version: u8) {
        if !is_version_compatible(version) {
            let reason = BanReason::IncompatibleVersion(version);
            if self.ban_reason(peer).as_ref() != Some(&reason) {
                self.ban(peer, reason);
            }
        } else if matches!(
            self.ban_reason(peer),
            Some(BanReason::IncompatibleVersion(_))
        ) {
            self.unban(peer);
        }
    }

    /// Ban a peer, replacing any earlier reason
    pub fn ban(&self, peer: &PeerIdentity, reason: BanReason) {
        info!("Banning peer {}: {}", peer, reason);
        self.entries.insert(
            peer.clone(),
            BanEntry {
                identity: peer.clone(),
                reason,
                since: Timestamp::now(),
            },
        );
    }

    /// Lift a ban. Returns whether the peer was banned.
    pub fn unban(&self, peer: &PeerIdentity) -> bool {
        let removed = self.entries.remove(peer).is_some();
        if removed {
            debug!("Unbanned peer {}", peer);
        }
        removed
    }

    /// Whether `peer` is banned
    pub fn is_banned(&self, peer: &PeerIdentity) -> bool {
        self.entries.contains_key(peer)
    }

    /// Reason `peer` is banned, if it is
    pub fn ban_reason(&self, peer: &PeerIdentity) -> Option<BanReason> {
        self.entries.get(peer).map(|e| e.reason.clone())
    }

    /// Snapshot of all bans
    pub fn all(&self) -> Vec<BanEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of banned peers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nobody is banned
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
