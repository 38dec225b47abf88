//! Delete-authorization capability tokens
//!
//! The creator of an encrypted packet keeps a random token and embeds it in
//! the encrypted payload. Storage nodes only ever see the token's hash. A
//! node removes the packet when presented with a token hashing to that value.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hash::sha256;

/// Capability secret required to delete a stored packet
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DeleteAuthorization([u8; 32]);

impl DeleteAuthorization {
    /// Generate a fresh random token
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing token bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw token bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash published next to the stored packet
    pub fn verification_hash(&self) -> [u8; 32] {
        sha256(&self.0)
    }

    /// Whether this token hashes to `verification_hash`.
    ///
    /// The comparison runs in constant time.
    pub fn matches(&self, verification_hash: &[u8; 32]) -> bool {
        let computed = self.verification_hash();
        computed
            .iter()
            .zip(verification_hash.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for DeleteAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeleteAuthorization(<redacted>)")
    }
}
