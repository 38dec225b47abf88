//! DHT error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, DhtError>;

/// DHT errors
#[derive(Debug, Error)]
pub enum DhtError {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Packet storage quota exhausted
    #[error("Storage full: {used} of {max} bytes used")]
    StorageFull { used: u64, max: u64 },

    /// Packet could not be encoded or decoded
    #[error("Packet error: {0}")]
    Packet(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Encoding error
    #[error("Encoding error: {0}")]
    EncodingError(String),

    /// Proof-of-work or signature failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Packet rejected by a storage handler
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for DhtError {
    fn from(err: std::io::Error) -> Self {
        DhtError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for DhtError {
    fn from(err: bincode::Error) -> Self {
        DhtError::EncodingError(err.to_string())
    }
}

impl From<sled::Error> for DhtError {
    fn from(err: sled::Error) -> Self {
        DhtError::Storage(err.to_string())
    }
}

impl From<courier_core::PacketError> for DhtError {
    fn from(err: courier_core::PacketError) -> Self {
        DhtError::Packet(err.to_string())
    }
}

impl From<courier_transport::TransportError> for DhtError {
    fn from(err: courier_transport::TransportError) -> Self {
        DhtError::Network(err.to_string())
    }
}

impl From<courier_crypto::CryptoError> for DhtError {
    fn from(err: courier_crypto::CryptoError) -> Self {
        DhtError::Crypto(err.to_string())
    }
}

impl From<tokio::task::JoinError> for DhtError {
    fn from(err: tokio::task::JoinError) -> Self {
        DhtError::Internal(err.to_string())
    }
}
