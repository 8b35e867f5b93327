//! Errors defined across the mixing implementation

use thiserror::Error;

/// The top level error type for mixing operations
///
/// Incomplete rounds are never reported through this type; a session that is
/// still waiting on packets simply stays in its current state
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MixError {
    /// A peer sent data that violates the protocol, the packet or session is
    /// abandoned and not retried
    #[error("protocol corruption: {0}")]
    Corruption(String),
    /// The deployment parameters or phonebook are malformed
    #[error("configuration error: {0}")]
    Config(String),
    /// A field operation was undefined, e.g. the inverse of zero
    #[error("arithmetic error: {0}")]
    Arithmetic(String),
    /// A packet or payload failed to encode or decode
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Encryption or decryption failed
    #[error("crypto error: {0}")]
    Crypto(String),
    /// A packet arrived that the local role does not accept from its sender
    #[error("unexpected packet: {0}")]
    UnexpectedPacket(String),
    /// An error on the transport
    #[error("network error: {0}")]
    Network(#[from] MixNetworkError),
}

impl MixError {
    /// Whether the error indicates a misbehaving or buggy peer
    pub fn is_corruption(&self) -> bool {
        matches!(self, MixError::Corruption(_))
    }
}

/// Errors raised by the transport
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MixNetworkError {
    /// Error sending a message
    #[error("send error: {0}")]
    SendError(String),
    /// Error receiving a message
    #[error("receive error: {0}")]
    RecvError(String),
    /// No route exists to the given persona
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    /// The stream was closed
    #[error("network closed")]
    Closed,
}
