//! Accepted message type.

use relay_protocol::ServerFrame;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = String;

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    uuid::Uuid::new_v4().to_string()
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A message accepted into history.
///
/// Messages are immutable once created and are shared as `Arc<Message>`
/// between the history store and every outbound queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned unique identifier.
    pub id: MessageId,
    /// Message text.
    pub content: String,
    /// Sender identifier.
    pub sender: String,
    /// Acceptance time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Create a message with a fresh id and the current time.
    #[must_use]
    pub fn new(content: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            content: content.into(),
            sender: sender.into(),
            timestamp: now_millis(),
        }
    }

    /// The wire frame for this message.
    #[must_use]
    pub fn to_frame(&self) -> ServerFrame {
        ServerFrame::Message {
            id: self.id.clone(),
            content: self.content.clone(),
            sender: self.sender.clone(),
            timestamp: self.timestamp,
        }
    }
}
