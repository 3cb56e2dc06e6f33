//! Bounded message history.
//!
//! An append-only ring buffer: once full, every append evicts the oldest
//! message. Readers only ever see a suffix.

use crate::message::Message;
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

/// Default number of retained messages.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Capacity-bounded, append-only log of accepted messages.
#[derive(Debug)]
pub struct HistoryStore {
    entries: RwLock<VecDeque<Arc<Message>>>,
    capacity: usize,
}

impl HistoryStore {
    /// Create a store with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a store retaining at most `capacity` messages (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    /// Append a message, returning the evicted oldest message if the store was full.
    pub fn append(&self, message: Arc<Message>) -> Option<Arc<Message>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(message);

        if let Some(old) = &evicted {
            trace!(message = %old.id, "Evicted oldest history entry");
        }
        evicted
    }

    /// The last `n` messages, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<Arc<Message>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Number of retained messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of retained messages.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}
