//! # relay-transport
//!
//! Transport abstraction layer for the relay broadcast server.
//!
//! Every transport hands a session two halves:
//!
//! - [`FrameReceiver`] - yields [`Incoming`] units, including an explicit
//!   [`Incoming::Closed`] when the peer disconnects
//! - [`FrameSender`] - writes [`ServerFrame`](relay_protocol::ServerFrame)s
//!
//! Implementations:
//!
//! - **WebSocket** - axum WebSocket upgrade (feature `websocket`)
//! - **Memory** - tokio channels, for tests and embedding
//!
//! ```rust,ignore
//! use relay_transport::{FrameReceiver, Incoming};
//!
//! async fn drain(mut rx: impl FrameReceiver) {
//!     while let Ok(incoming) = rx.recv().await {
//!         if incoming == Incoming::Closed {
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{ConnectionId, FrameReceiver, FrameSender, Incoming, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketReceiver, WebSocketSender};
