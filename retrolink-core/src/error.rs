//! Link Error Types
//!
//! Error types for the packet connection and the managers built on it.

use thiserror::Error;

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors surfaced by the link layer.
///
/// `Clone` because the reliability layer retains the last observed close
/// error until the reconnect outcome is known.
#[derive(Error, Debug, Clone)]
pub enum LinkError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("Transport failed: {0}")]
    TransportFailed(String),

    #[error("Truncated packet frame: {0} bytes")]
    TruncatedFrame(usize),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
