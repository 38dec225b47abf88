//! Identifiers, the XOR metric and timestamps

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{PacketError, Result};

/// Largest accepted peer identity
pub const MAX_IDENTITY_LENGTH: usize = 1024;

/// A 256-bit hash identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash256([u8; 32]);

/// Key under which a packet is stored in the DHT
pub type DhtKey = Hash256;

/// Position of a peer in the DHT key space
pub type PeerId = Hash256;

impl Hash256 {
    /// All-zero identifier
    pub const ZERO: Self = Self([0u8; 32]);

    /// Wrap raw bytes
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// SHA-256 of `data`
    pub fn digest(data: &[u8]) -> Self {
        Self(courier_crypto::sha256(data))
    }

    /// Uniformly random identifier
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Random identifier sharing exactly `prefix_len` leading bits with
    /// `local`. Used to pick lookup targets when refreshing a k-bucket.
    pub fn random_with_prefix(local: &Hash256, prefix_len: usize) -> Self {
        if prefix_len >= 256 {
            return *local;
        }

        let mut distance = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut distance);

        let byte_idx = prefix_len / 8;
        let bit = 0x80u8 >> (prefix_len % 8);
        for byte in distance.iter_mut().take(byte_idx) {
            *byte = 0;
        }
        distance[byte_idx] = bit | (distance[byte_idx] & bit.wrapping_sub(1));

        let mut target = [0u8; 32];
        for (i, byte) in target.iter_mut().enumerate() {
            *byte = local.0[i] ^ distance[i];
        }
        Self(target)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance to `other`
    pub fn distance(&self, other: &Hash256) -> Distance {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Number of leading bits shared with `other` (256 when equal)
    pub fn shared_prefix_len(&self, other: &Hash256) -> usize {
        self.distance(other).leading_zeros()
    }

    /// URL-safe base64, used for file names and stamp resources
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parse the URL-safe base64 form
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| PacketError::Malformed(format!("bad base64 key: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PacketError::Malformed("key must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }

    /// Hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self)
    }
}

/// XOR distance between two identifiers, ordered as a big-endian integer
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Distance([u8; 32]);

impl Distance {
    /// Zero distance
    pub const ZERO: Self = Self([0u8; 32]);

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Number of leading zero bits; equals the shared prefix length
    pub fn leading_zeros(&self) -> usize {
        courier_crypto::leading_zero_bits(&self.0) as usize
    }

    /// Whether the two identifiers were equal
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

/// Opaque transport destination of a remote node.
///
/// Equality and hashing use the raw destination bytes; the 256-bit id used
/// for routing is derived once at construction.
#[derive(Clone)]
pub struct PeerIdentity {
    bytes: Bytes,
    id: PeerId,
}

impl PeerIdentity {
    /// Wrap destination bytes (1 to 1024 bytes)
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > MAX_IDENTITY_LENGTH {
            return Err(PacketError::InvalidIdentity(format!(
                "length {} outside 1..={}",
                bytes.len(),
                MAX_IDENTITY_LENGTH
            )));
        }
        let id = Hash256::digest(&bytes);
        Ok(Self { bytes, id })
    }

    /// Random 32-byte destination, for simulations and tests
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let bytes = Bytes::copy_from_slice(&bytes);
        let id = Hash256::digest(&bytes);
        Self { bytes, id }
    }

    /// Routing id (SHA-256 of the destination bytes)
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Raw destination bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// URL-safe base64 of the destination
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.bytes)
    }

    /// Parse the URL-safe base64 form
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s.trim())
            .map_err(|e| PacketError::InvalidIdentity(format!("bad base64: {}", e)))?;
        Self::new(bytes)
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_base64();
        write!(f, "{}", &encoded[..encoded.len().min(12)])
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({})", self)
    }
}

/// Random identifier of a communication packet, echoed by its response
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId([u8; 32]);

impl PacketId {
    /// Fresh random id
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..12])
    }
}

impl fmt::Debug for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketId({})", self)
    }
}

/// Timestamp in milliseconds since Unix epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    /// Create from milliseconds
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Create from seconds
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1000)
    }

    /// Get as milliseconds
    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Get as seconds
    pub fn as_secs(&self) -> i64 {
        self.0 / 1000
    }

    /// This timestamp shifted forward by `duration`
    pub fn plus(&self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// This timestamp shifted back by `duration`
    pub fn minus(&self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(millis))
    }

    /// Time elapsed from `earlier` to this timestamp (zero if negative)
    pub fn since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    /// Get as chrono DateTime
    pub fn as_datetime(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_datetime().format("%Y-%m-%d %H:%M:%S UTC"))
    }
}
