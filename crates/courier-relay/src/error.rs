//! Relay error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Queue storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Relay request or queued entry could not be decoded
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Stamp missing, malformed or too cheap
    #[error("Invalid stamp: {0}")]
    InvalidStamp(String),

    /// Store worker queue is full
    #[error("Store queue full")]
    QueueFull,

    /// DHT store failed
    #[error("DHT error: {0}")]
    Dht(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for RelayError {
    fn from(err: bincode::Error) -> Self {
        RelayError::InvalidPacket(err.to_string())
    }
}

impl From<courier_core::PacketError> for RelayError {
    fn from(err: courier_core::PacketError) -> Self {
        RelayError::InvalidPacket(err.to_string())
    }
}

impl From<courier_crypto::CryptoError> for RelayError {
    fn from(err: courier_crypto::CryptoError) -> Self {
        RelayError::InvalidStamp(err.to_string())
    }
}

impl From<courier_dht::DhtError> for RelayError {
    fn from(err: courier_dht::DhtError) -> Self {
        RelayError::Dht(err.to_string())
    }
}

impl From<courier_transport::TransportError> for RelayError {
    fn from(err: courier_transport::TransportError) -> Self {
        RelayError::Network(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RelayError {
    fn from(err: tokio::task::JoinError) -> Self {
        RelayError::Internal(err.to_string())
    }
}
