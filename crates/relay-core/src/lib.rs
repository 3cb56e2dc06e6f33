//! # relay-core
//!
//! Connection registry, bounded history and broadcast engine for the relay.
//!
//! - **History** - capacity-bounded, append-only log of accepted messages
//! - **Registry** - live receivers, each a bounded outbound queue
//! - **Broadcaster** - appends to history, then fans out to every receiver
//! - **Session** - binds a connection to the broadcaster (join, replay, publish, leave)
//! - **Heartbeat** - independent per-connection liveness emitter
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  publish   ┌─────────────┐  append   ┌─────────────┐
//! │   Session   │───────────▶│ Broadcaster │──────────▶│   History   │
//! └─────────────┘            └─────────────┘           └─────────────┘
//!        ▲                          │ snapshot
//!        │ writer task              ▼
//!  ┌───────────┐   enqueue   ┌─────────────┐
//!  │  outbound │◀────────────│  Registry   │
//!  │   queue   │             └─────────────┘
//!  └───────────┘
//! ```

pub mod broadcast;
pub mod heartbeat;
pub mod history;
pub mod message;
pub mod registry;
pub mod session;

pub use broadcast::{BroadcastConfig, BroadcastStats, Broadcaster, Joined, Published};
pub use heartbeat::{Heartbeat, HeartbeatSummary};
pub use history::HistoryStore;
pub use message::{Message, MessageId};
pub use registry::{DeliveryError, Endpoint, ReceiverHandle, ReceiverRegistry};
pub use session::{
    CloseReason, MalformedPolicy, Session, SessionConfig, SessionState, SessionSummary,
};
