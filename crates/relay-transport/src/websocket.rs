//! WebSocket transport on top of axum's WebSocket upgrade.
//!
//! Inbound text messages are decoded as JSON submissions, inbound binary
//! messages as length-prefixed MessagePack, one submission per message. Outbound frames use the encoding
//! chosen for the connection.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::codec::{self, Encoding, LENGTH_PREFIX_SIZE};
use relay_protocol::{error_codes, ServerFrame, Submission};
use tracing::{debug, warn};

use crate::traits::{FrameReceiver, FrameSender, Incoming, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Encoding for outbound frames.
    pub encoding: Encoding,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Json,
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// Split an upgraded socket into independent sender and receiver halves.
#[must_use]
pub fn split(socket: WebSocket, config: &WebSocketConfig) -> (WebSocketSender, WebSocketReceiver) {
    let (sink, stream) = socket.split();
    (
        WebSocketSender {
            sink,
            encoding: config.encoding,
            closed: false,
        },
        WebSocketReceiver {
            stream,
            max_message_size: config.max_message_size,
            closed: false,
        },
    )
}

/// Outbound half of a WebSocket connection.
pub struct WebSocketSender {
    sink: SplitSink<WebSocket, Message>,
    encoding: Encoding,
    closed: bool,
}

#[async_trait]
impl FrameSender for WebSocketSender {
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match self.encoding {
            Encoding::Json => Message::Text(codec::encode_json(frame)?),
            Encoding::Msgpack => Message::Binary(codec::encode_msgpack(frame)?.to_vec()),
        };

        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(()); // Already closed
        }

        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}

/// Inbound half of a WebSocket connection.
pub struct WebSocketReceiver {
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
    closed: bool,
}

fn too_large(size: usize, max: usize) -> Incoming {
    warn!("Message too large: {} bytes (max: {})", size, max);
    Incoming::Malformed {
        code: error_codes::TOO_LARGE,
        reason: format!("message is {} bytes, limit is {}", size, max),
    }
}

fn malformed(reason: impl Into<String>) -> Incoming {
    Incoming::Malformed {
        code: error_codes::MALFORMED,
        reason: reason.into(),
    }
}

/// Decode one text message as a JSON submission.
fn decode_text(text: &str, max_message_size: usize) -> Incoming {
    if text.len() > max_message_size {
        return too_large(text.len(), max_message_size);
    }

    match codec::decode_json::<Submission>(text) {
        Ok(submission) => Incoming::Submission(submission),
        Err(e) => malformed(e.to_string()),
    }
}

/// Decode one binary message as exactly one length-prefixed MessagePack submission.
fn decode_binary(data: &[u8], max_message_size: usize) -> Incoming {
    if data.len() > max_message_size + LENGTH_PREFIX_SIZE {
        return too_large(data.len(), max_message_size);
    }

    let mut buf = BytesMut::from(data);
    match codec::decode_msgpack_from::<Submission>(&mut buf) {
        Ok(Some(_)) if !buf.is_empty() => {
            malformed(format!("{} trailing bytes after submission", buf.len()))
        }
        Ok(Some(submission)) => Incoming::Submission(submission),
        Ok(None) => malformed("incomplete frame"),
        Err(e) => malformed(e.to_string()),
    }
}

#[async_trait]
impl FrameReceiver for WebSocketReceiver {
    async fn recv(&mut self) -> Result<Incoming, TransportError> {
        if self.closed {
            return Ok(Incoming::Closed);
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(decode_text(&text, self.max_message_size));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(decode_binary(&data, self.max_message_size));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // axum answers pings itself
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.closed = true;
                    return Ok(Incoming::Closed);
                }
                Some(Err(e)) => {
                    self.closed = true;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    self.closed = true;
                    return Ok(Incoming::Closed);
                }
            }
        }
    }
}
