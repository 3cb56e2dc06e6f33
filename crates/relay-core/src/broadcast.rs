//! Broadcast engine.
//!
//! The [`Broadcaster`] owns the history store and the receiver registry. Every
//! publish is appended to history first; fan-out to receivers happens after and
//! can only fail per receiver.

use crate::history::{HistoryStore, DEFAULT_HISTORY_CAPACITY};
use crate::message::Message;
use crate::registry::{DeliveryError, Endpoint, ReceiverHandle, ReceiverRegistry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, trace, warn};

/// Default number of history entries replayed to a joining receiver.
pub const DEFAULT_REPLAY_COUNT: usize = 10;

/// Broadcaster configuration.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Maximum number of retained messages.
    pub history_capacity: usize,
    /// Number of recent messages replayed on join.
    pub replay_count: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            replay_count: DEFAULT_REPLAY_COUNT,
        }
    }
}

/// Outcome of a publish.
///
/// The message is in history regardless of the fan-out counts.
#[derive(Debug, Clone)]
pub struct Published {
    /// The accepted message.
    pub message: Arc<Message>,
    /// Receivers the message was queued for.
    pub delivered: usize,
    /// Receivers that missed the message (queue full or gone).
    pub dropped: usize,
}

impl Published {
    /// Whether every receiver in the snapshot got the message.
    #[must_use]
    pub fn fully_delivered(&self) -> bool {
        self.dropped == 0
    }
}

/// Outcome of a join.
#[derive(Debug, Clone, Copy)]
pub struct Joined {
    /// Handle to pass to [`Broadcaster::leave`].
    pub handle: ReceiverHandle,
    /// Number of history messages queued as replay.
    pub replayed: usize,
}

/// Broadcaster statistics.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    /// Live receivers.
    pub receivers: usize,
    /// Retained history entries.
    pub history_len: usize,
    /// Messages accepted since start.
    pub published: u64,
    /// Successful per-receiver deliveries since start.
    pub delivered: u64,
    /// Missed per-receiver deliveries since start.
    pub dropped: u64,
}

/// Owner of history and receivers; the single entry point for publishing.
#[derive(Debug)]
pub struct Broadcaster {
    history: HistoryStore,
    registry: ReceiverRegistry,
    /// Orders "append + snapshot" against "register + replay" so a joining
    /// receiver sees each message exactly once. Never held across delivery.
    sequencer: Mutex<()>,
    config: BroadcastConfig,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Broadcaster {
    /// Create a broadcaster with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BroadcastConfig::default())
    }

    /// Create a broadcaster with custom configuration.
    #[must_use]
    pub fn with_config(config: BroadcastConfig) -> Self {
        info!("Creating broadcaster with config: {:?}", config);
        Self {
            history: HistoryStore::with_capacity(config.history_capacity),
            registry: ReceiverRegistry::new(),
            sequencer: Mutex::new(()),
            config,
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Broadcaster configuration.
    #[must_use]
    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Accept a message into history and fan it out to every live receiver.
    ///
    /// Never fails: per-receiver problems only show up in the returned counts.
    pub fn publish(&self, content: impl Into<String>, sender: impl Into<String>) -> Published {
        let message = Arc::new(Message::new(content, sender));
        let frame = Arc::new(message.to_frame());

        let receivers = {
            let _order = self.sequencer.lock().unwrap_or_else(PoisonError::into_inner);
            self.history.append(Arc::clone(&message));
            self.registry.snapshot()
        };
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (handle, endpoint) in &receivers {
            match endpoint.deliver(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Full) => {
                    warn!(
                        connection = %endpoint.connection_id(),
                        message = %message.id,
                        "Outbound queue full, dropping message for slow receiver"
                    );
                }
                Err(DeliveryError::Closed) => gone.push(*handle),
            }
        }

        // Sessions unregister themselves too; this only speeds up cleanup
        for handle in &gone {
            if self.registry.unregister(*handle) {
                debug!(handle = %handle, "Pruned closed receiver");
            }
        }

        let dropped = receivers.len() - delivered;
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);

        trace!(
            message = %message.id,
            recipients = delivered,
            dropped,
            "Published message"
        );

        Published {
            message,
            delivered,
            dropped,
        }
    }

    /// Register a receiver and queue the recent history for it.
    ///
    /// The replay is queued before any message published after the join.
    pub fn join(&self, endpoint: Endpoint) -> Joined {
        let _order = self.sequencer.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = self.registry.register(endpoint.clone());

        let mut replayed = 0;
        for message in self.history.tail(self.config.replay_count) {
            if let Err(e) = endpoint.deliver(Arc::new(message.to_frame())) {
                warn!(
                    connection = %endpoint.connection_id(),
                    error = %e,
                    "Replay truncated"
                );
                break;
            }
            replayed += 1;
        }

        debug!(connection = %endpoint.connection_id(), replayed, "Receiver joined");
        Joined { handle, replayed }
    }

    /// Unregister a receiver. Safe to call more than once.
    pub fn leave(&self, handle: ReceiverHandle) -> bool {
        self.registry.unregister(handle)
    }

    /// The most recent `limit` messages, oldest first.
    #[must_use]
    pub fn history(&self, limit: usize) -> Vec<Arc<Message>> {
        self.history.tail(limit)
    }

    /// The receiver registry.
    #[must_use]
    pub fn registry(&self) -> &ReceiverRegistry {
        &self.registry
    }

    /// The history store.
    #[must_use]
    pub fn history_store(&self) -> &HistoryStore {
        &self.history
    }

    /// Get broadcaster statistics.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            receivers: self.registry.len(),
            history_len: self.history.len(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
