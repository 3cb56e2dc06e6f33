//! Frame types for the relay protocol.
//!
//! Clients send [`Submission`]s; the server answers with [`ServerFrame`]s.
//! Both sides may be carried as JSON text or length-prefixed MessagePack.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes carried by [`ServerFrame::Error`].
pub mod error_codes {
    /// The payload could not be decoded.
    pub const MALFORMED: u16 = 4000;
    /// The payload decoded but failed validation.
    pub const INVALID: u16 = 4001;
    /// The payload exceeded the configured size limit.
    pub const TOO_LARGE: u16 = 4002;
}

/// Reasons a decoded submission is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Sender identifier is empty or whitespace.
    #[error("sender must not be empty")]
    EmptySender,

    /// Content is empty.
    #[error("content must not be empty")]
    EmptyContent,

    /// Content exceeds the size limit.
    #[error("content is {len} bytes, limit is {max}")]
    ContentTooLarge { len: usize, max: usize },
}

impl ValidationError {
    /// The wire error code for this rejection.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            ValidationError::ContentTooLarge { .. } => error_codes::TOO_LARGE,
            _ => error_codes::INVALID,
        }
    }
}

/// A message submitted by a client, either over a session or over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Message text.
    pub content: String,
    /// Sender identifier chosen by the client.
    pub sender: String,
}

impl Submission {
    /// Create a new submission.
    #[must_use]
    pub fn new(content: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sender: sender.into(),
        }
    }

    /// Check the submission against the relay's acceptance rules.
    ///
    /// # Errors
    ///
    /// Returns the first rule the submission breaks.
    pub fn validate(&self, max_content_len: usize) -> Result<(), ValidationError> {
        if self.sender.trim().is_empty() {
            return Err(ValidationError::EmptySender);
        }
        if self.content.is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        if self.content.len() > max_content_len {
            return Err(ValidationError::ContentTooLarge {
                len: self.content.len(),
                max: max_content_len,
            });
        }
        Ok(())
    }
}

/// A frame sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// An accepted message, live or replayed from history.
    #[serde(rename = "message")]
    Message {
        /// Server-assigned unique identifier.
        id: String,
        /// Message text.
        content: String,
        /// Sender identifier.
        sender: String,
        /// Acceptance time in milliseconds since the Unix epoch.
        timestamp: u64,
    },

    /// A rejection reported to the originating client only.
    #[serde(rename = "error")]
    Error {
        /// Error code, see [`error_codes`].
        code: u16,
        /// Human-readable reason.
        message: String,
    },

    /// Liveness marker with no payload.
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl ServerFrame {
    /// Short name of the frame variant, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Message { .. } => "message",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Heartbeat => "heartbeat",
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }

    /// Create an Error frame from a validation failure.
    #[must_use]
    pub fn rejected(err: &ValidationError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}
