//! Packet encoding and decoding errors

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PacketError>;

/// Errors raised while reading or writing packets
#[derive(Debug, Error)]
pub enum PacketError {
    /// Input ended before a field was complete
    #[error("Truncated packet: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// Type tag not present in the registry
    #[error("Unknown packet type: {0:#04x}")]
    UnknownType(u8),

    /// Sender speaks a protocol version we no longer accept
    #[error("Incompatible protocol version: {0}")]
    IncompatibleVersion(u8),

    /// Structurally invalid content
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// Content-derived key does not match the key carried by the packet
    #[error("DHT key does not match packet contents")]
    KeyMismatch,

    /// Encoded form exceeds a size limit
    #[error("Packet too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// Peer identity bytes out of range
    #[error("Invalid peer identity: {0}")]
    InvalidIdentity(String),
}
