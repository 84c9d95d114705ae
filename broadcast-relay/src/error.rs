use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::connection::ConnectionId;

/// Failures of registry and dispatch operations.
///
/// Only `ResourceExhausted` ever reaches a client, as a rejected handshake.
/// The rest are handled per recipient and never abort a broadcast.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("connection limit of {limit} reached")]
    ResourceExhausted { limit: usize },

    #[error("connection {0} is not registered")]
    NotFound(ConnectionId),

    #[error("outbound queue for connection {0} is full")]
    QueueFull(ConnectionId),

    #[error("outbound queue capacity must be at least 1")]
    ZeroQueueCapacity,

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}

impl RelayError {
    /// Whether the error belongs to a single recipient of a broadcast.
    pub fn is_recipient_local(&self) -> bool {
        matches!(self, RelayError::NotFound(_) | RelayError::QueueFull(_))
    }
}
