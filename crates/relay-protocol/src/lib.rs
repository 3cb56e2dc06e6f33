//! # relay-protocol
//!
//! Wire protocol definitions for the relay broadcast server.
//!
//! ## Frames
//!
//! - `Submission` - `{content, sender}` sent by clients
//! - `ServerFrame::Message` - an accepted message, live or replayed
//! - `ServerFrame::Error` - a rejection reported to one client
//! - `ServerFrame::Heartbeat` - liveness marker
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, ServerFrame, Submission};
//!
//! let sub: Submission = codec::decode_json(r#"{"content":"hi","sender":"alice"}"#).unwrap();
//! assert!(sub.validate(1024).is_ok());
//!
//! let text = codec::encode_json(&ServerFrame::Heartbeat).unwrap();
//! assert_eq!(text, r#"{"type":"heartbeat"}"#);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{Encoding, ProtocolError};
pub use frames::{error_codes, ServerFrame, Submission, ValidationError};
