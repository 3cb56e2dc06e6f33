//! # relay-server
//!
//! HTTP and WebSocket surface for the broadcast relay: message sessions,
//! heartbeat connections, the submit/history API and metrics export.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{build_router, run_server, serve, AppState};
