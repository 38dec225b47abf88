//! Error types for cryptographic operations

use thiserror::Error;

/// Result type alias for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid signature
    #[error("Invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Stamp could not be parsed
    #[error("Invalid proof-of-work stamp: {0}")]
    InvalidStamp(String),

    /// Stamp does not carry enough work
    #[error("Insufficient proof of work: required {required} bits, got {actual}")]
    InsufficientWork { required: u32, actual: u32 },

    /// Stamp was minted for a different resource
    #[error("Stamp resource mismatch: expected {expected}, got {actual}")]
    ResourceMismatch { expected: String, actual: String },

    /// Stamp date lies outside the accepted window
    #[error("Stamp expired or post-dated: {0}")]
    StampExpired(String),
}
