//! Ed25519 signatures for self-certifying directory entries

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::{CryptoError, Result};

/// Signing key of a directory entry owner
pub struct DirectorySigner {
    signing_key: SigningKey,
}

impl DirectorySigner {
    /// Generate a new random signing key
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from secret bytes
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Public key bytes to publish alongside signed data
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Verify `signature` over `message` with a raw Ed25519 public key
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<()> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let signature = Signature::from_bytes(signature);
    key.verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = DirectorySigner::generate();
        let signature = signer.sign(b"alice");
        verify_signature(&signer.public_key(), b"alice", &signature).unwrap();
    }

    #[test]
    fn test_tampered_message_fails() {
        let signer = DirectorySigner::generate();
        let signature = signer.sign(b"alice");
        assert!(matches!(
            verify_signature(&signer.public_key(), b"mallory", &signature),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn test_restored_signer_has_same_key() {
        let secret = [7u8; 32];
        let a = DirectorySigner::from_secret_bytes(&secret);
        let b = DirectorySigner::from_secret_bytes(&secret);
        assert_eq!(a.public_key(), b.public_key());
    }
}
