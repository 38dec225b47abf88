//! Error types for the transport layer

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Destination is not known to the transport
    #[error("Destination unreachable: {0}")]
    Unreachable(String),

    /// Destination bytes cannot be interpreted by this transport
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Local endpoint is offline
    #[error("Local endpoint is offline")]
    Offline,

    /// Packet could not be encoded
    #[error("Packet error: {0}")]
    Packet(String),

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<courier_core::PacketError> for TransportError {
    fn from(err: courier_core::PacketError) -> Self {
        TransportError::Packet(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}
