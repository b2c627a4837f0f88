//! Network error types.

use std::net::SocketAddr;
use std::time::Duration;

use crate::message::MessageTypeId;

/// Errors that can occur in the melomans_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// An inbound identifier matched no live subscription.
    #[error("No subscription for message type {0}")]
    Unroutable(MessageTypeId),

    /// The remote peer answered the handshake with `AccessDenied`.
    #[error("Handshake rejected by {peer}")]
    HandshakeRejected { peer: SocketAddr },

    /// Cooperative cancellation was observed during a task run.
    #[error("Operation cancelled")]
    Cancelled,

    /// A transport-level error (connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// A subscription for this message type is already registered.
    #[error("Duplicate subscription for message type {0}")]
    DuplicateSubscription(MessageTypeId),

    /// The operation is not valid in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The router has not been initialized.
    #[error("Router not running")]
    NotRunning,

    /// Malformed bytes on the wire.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame exceeded the allowed size.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Whether this error is the cooperative cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
