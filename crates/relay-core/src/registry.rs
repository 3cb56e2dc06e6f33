//! Registry of live receivers.
//!
//! Each connected session registers one [`Endpoint`]: the sending side of its
//! bounded outbound queue. The registry never owns the connection itself.

use dashmap::DashMap;
use relay_protocol::ServerFrame;
use relay_transport::ConnectionId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Handle identifying exactly one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverHandle(u64);

impl ReceiverHandle {
    /// The raw handle value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReceiverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rx-{}", self.0)
    }
}

/// Why a frame could not be queued for a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The receiver's outbound queue is full.
    #[error("outbound queue full")]
    Full,
    /// The receiver's session has gone away.
    #[error("receiver closed")]
    Closed,
}

/// Outbound endpoint of one connected session.
#[derive(Debug, Clone)]
pub struct Endpoint {
    connection_id: ConnectionId,
    queue: mpsc::Sender<Arc<ServerFrame>>,
}

impl Endpoint {
    /// Create an endpoint feeding the given outbound queue.
    #[must_use]
    pub fn new(connection_id: ConnectionId, queue: mpsc::Sender<Arc<ServerFrame>>) -> Self {
        Self {
            connection_id,
            queue,
        }
    }

    /// The connection this endpoint belongs to.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Queue a frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Full`] if the queue is at capacity and
    /// [`DeliveryError::Closed`] if its consumer has gone away.
    pub fn deliver(&self, frame: Arc<ServerFrame>) -> Result<(), DeliveryError> {
        self.queue.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// The set of currently live receivers.
#[derive(Debug, Default)]
pub struct ReceiverRegistry {
    entries: DashMap<ReceiverHandle, Endpoint>,
    next_handle: AtomicU64,
}

impl ReceiverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint, returning the handle that removes exactly this entry.
    pub fn register(&self, endpoint: Endpoint) -> ReceiverHandle {
        let handle = ReceiverHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!(
            connection = %endpoint.connection_id,
            handle = %handle,
            "Receiver registered"
        );
        self.entries.insert(handle, endpoint);
        debug!(receivers = self.entries.len(), "Registry grew");
        handle
    }

    /// Remove an entry. Returns `false` if it was already gone.
    pub fn unregister(&self, handle: ReceiverHandle) -> bool {
        match self.entries.remove(&handle) {
            Some((_, endpoint)) => {
                debug!(
                    connection = %endpoint.connection_id,
                    handle = %handle,
                    receivers = self.entries.len(),
                    "Receiver unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Current membership in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ReceiverHandle, Endpoint)> {
        let mut members: Vec<_> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        members.sort_unstable_by_key(|(handle, _)| *handle);
        members
    }

    /// Whether a handle is still registered.
    #[must_use]
    pub fn contains(&self, handle: ReceiverHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    /// Number of live receivers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no live receivers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
