//! Transport abstraction traits for the relay.
//!
//! A connection is used as two independent halves so that a session can read
//! inbound traffic while a separate task drains its outbound queue.

use async_trait::async_trait;
use relay_protocol::{ServerFrame, Submission};
use std::fmt;
use thiserror::Error;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
///
/// A clean disconnect is not an error; it is reported as [`Incoming::Closed`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// Send attempted on a connection that is already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error while encoding an outbound frame.
    #[error("Protocol error: {0}")]
    Protocol(#[from] relay_protocol::ProtocolError),
}

/// One unit of inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A decoded submission. Validation is the caller's job.
    Submission(Submission),
    /// A payload that could not be decoded.
    Malformed {
        /// Error code to report back, see `relay_protocol::error_codes`.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
    /// The peer closed the connection.
    Closed,
}

/// Outbound half of a connection.
#[async_trait]
pub trait FrameSender: Send {
    /// Send a frame to the peer.
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError>;

    /// Close the connection gracefully. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a connection.
#[async_trait]
pub trait FrameReceiver: Send {
    /// Wait for the next inbound unit.
    ///
    /// Once [`Incoming::Closed`] has been returned, every further call
    /// returns it again.
    async fn recv(&mut self) -> Result<Incoming, TransportError>;
}
