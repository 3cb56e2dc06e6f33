//! In-process transport backed by tokio channels.
//!
//! Used to drive sessions without a network, mainly in tests. The
//! [`MemoryClient`] plays the remote peer.

use async_trait::async_trait;
use relay_protocol::{codec, error_codes, ServerFrame, Submission};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::traits::{FrameReceiver, FrameSender, Incoming, TransportError};

type Inbound = Result<Incoming, String>;

/// Create a connected in-memory transport.
///
/// Returns the server-side halves and the client end.
#[must_use]
pub fn channel() -> (MemorySender, MemoryReceiver, MemoryClient) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    (
        MemorySender {
            tx: Some(out_tx),
            closed: Arc::clone(&closed),
        },
        MemoryReceiver {
            rx: in_rx,
            finished: false,
        },
        MemoryClient {
            inbound: Some(in_tx),
            outbound: out_rx,
            closed_by_server: closed,
        },
    )
}

/// Server-side outbound half.
pub struct MemorySender {
    tx: Option<mpsc::UnboundedSender<ServerFrame>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSender for MemorySender {
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame.clone())
            .map_err(|_| TransportError::SendFailed("peer is gone".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Server-side inbound half.
pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
    finished: bool,
}

#[async_trait]
impl FrameReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Result<Incoming, TransportError> {
        if self.finished {
            return Ok(Incoming::Closed);
        }

        match self.rx.recv().await {
            Some(Ok(Incoming::Closed)) | None => {
                self.finished = true;
                Ok(Incoming::Closed)
            }
            Some(Ok(incoming)) => Ok(incoming),
            Some(Err(reason)) => {
                self.finished = true;
                Err(TransportError::ReceiveFailed(reason))
            }
        }
    }
}

/// The remote end of an in-memory connection.
pub struct MemoryClient {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: mpsc::UnboundedReceiver<ServerFrame>,
    closed_by_server: Arc<AtomicBool>,
}

impl MemoryClient {
    fn push(&self, item: Inbound) -> bool {
        self.inbound
            .as_ref()
            .map(|tx| tx.send(item).is_ok())
            .unwrap_or(false)
    }

    /// Submit a message. Returns `false` if the server side is gone.
    pub fn submit(&self, content: impl Into<String>, sender: impl Into<String>) -> bool {
        self.push(Ok(Incoming::Submission(Submission::new(content, sender))))
    }

    /// Send a JSON text payload, decoded the way a WebSocket text message is.
    pub fn send_text(&self, text: &str) -> bool {
        let incoming = match codec::decode_json::<Submission>(text) {
            Ok(submission) => Incoming::Submission(submission),
            Err(e) => Incoming::Malformed {
                code: error_codes::MALFORMED,
                reason: e.to_string(),
            },
        };
        self.push(Ok(incoming))
    }

    /// Inject a transport fault on the server's receive side.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.push(Err(reason.into()))
    }

    /// Disconnect from the client side.
    pub fn close(&mut self) {
        self.inbound = None;
    }

    /// Wait for the next frame from the server.
    ///
    /// Returns `None` once the server has closed and all frames are drained.
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.outbound.recv().await
    }

    /// Take the next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<ServerFrame> {
        self.outbound.try_recv().ok()
    }

    /// Stop accepting frames, so that further server sends fail.
    pub fn stop_reading(&mut self) {
        self.outbound.close();
        while self.outbound.try_recv().is_ok() {}
    }

    /// Whether the server closed its outbound half.
    #[must_use]
    pub fn is_closed_by_server(&self) -> bool {
        self.closed_by_server.load(Ordering::SeqCst)
    }
}
