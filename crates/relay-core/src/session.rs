//! Session lifecycle.
//!
//! A session binds one transport connection to the broadcaster:
//!
//! ```text
//! Connecting ──join + replay──▶ Active ──close / fault / send failure──▶ Closed
//! ```
//!
//! While active, inbound submissions are published and everything queued for
//! the session's endpoint is written out by a dedicated writer task.

use crate::broadcast::Broadcaster;
use crate::registry::Endpoint;
use relay_protocol::ServerFrame;
use relay_transport::{ConnectionId, FrameReceiver, FrameSender, Incoming, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How long a closing session keeps flushing its outbound queue.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What to do with an inbound payload that cannot be published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Send an error frame to the originating client and keep the session.
    #[default]
    Report,
    /// Drop the payload silently and keep the session.
    Ignore,
    /// Send an error frame and close the session.
    Disconnect,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Outbound queue capacity (raised to fit the replay if needed).
    pub outbound_capacity: usize,
    /// Maximum submission content size in bytes.
    pub max_message_size: usize,
    /// Handling of malformed or invalid payloads.
    pub malformed_policy: MalformedPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            max_message_size: 64 * 1024,
            malformed_policy: MalformedPolicy::Report,
        }
    }
}

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, not yet registered.
    Connecting,
    /// Registered and processing traffic.
    Active,
    /// Unregistered. Terminal.
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client disconnected.
    ClientClosed,
    /// Reading from the transport failed.
    TransportFault(String),
    /// Writing to the transport failed.
    SendFailed(String),
    /// Closed by [`MalformedPolicy::Disconnect`].
    Rejected,
}

impl CloseReason {
    /// Whether the close was caused by an unexpected transport failure.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, CloseReason::TransportFault(_) | CloseReason::SendFailed(_))
    }
}

/// Summary returned when a session ends.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// The session's connection.
    pub connection_id: ConnectionId,
    /// Why it ended.
    pub reason: CloseReason,
    /// Final state, always [`SessionState::Closed`].
    pub state: SessionState,
    /// Messages replayed on join.
    pub replayed: usize,
    /// Submissions published.
    pub published: u64,
    /// Payloads rejected as malformed or invalid.
    pub rejected: u64,
}

/// One connected client.
pub struct Session {
    id: ConnectionId,
    broadcaster: Arc<Broadcaster>,
    config: SessionConfig,
    state: SessionState,
}

impl Session {
    /// Create a session for an accepted connection.
    #[must_use]
    pub fn new(id: ConnectionId, broadcaster: Arc<Broadcaster>, config: SessionConfig) -> Self {
        Self {
            id,
            broadcaster,
            config,
            state: SessionState::Connecting,
        }
    }

    /// The session's connection ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!(connection = %self.id, from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }

    /// Run the session until the connection ends.
    ///
    /// The replay is queued before any inbound traffic is read, and the
    /// session is unregistered exactly once on the way out.
    pub async fn run<S, R>(mut self, sender: S, mut receiver: R) -> SessionSummary
    where
        S: FrameSender + 'static,
        R: FrameReceiver,
    {
        let capacity = self
            .config
            .outbound_capacity
            .max(self.broadcaster.config().replay_count + 1);
        let (queue_tx, queue_rx) = mpsc::channel(capacity);

        let joined = self
            .broadcaster
            .join(Endpoint::new(self.id.clone(), queue_tx.clone()));
        self.transition(SessionState::Active);
        info!(connection = %self.id, replayed = joined.replayed, "Session active");

        let mut writer = tokio::spawn(write_loop(self.id.clone(), sender, queue_rx));
        let mut writer_done = false;
        let mut published = 0;
        let mut rejected = 0;

        let reason = loop {
            tokio::select! {
                biased;

                // The writer only stops early when a send fails
                result = &mut writer => {
                    writer_done = true;
                    let detail = match result {
                        Ok(Err(e)) => e.to_string(),
                        Ok(Ok(())) => "writer stopped".to_string(),
                        Err(e) => e.to_string(),
                    };
                    error!(connection = %self.id, error = %detail, "Send failed");
                    break CloseReason::SendFailed(detail);
                }

                incoming = receiver.recv() => match incoming {
                    Ok(Incoming::Submission(submission)) => {
                        match submission.validate(self.config.max_message_size) {
                            Ok(()) => {
                                let result = self
                                    .broadcaster
                                    .publish(submission.content, submission.sender);
                                published += 1;
                                debug!(
                                    connection = %self.id,
                                    message = %result.message.id,
                                    recipients = result.delivered,
                                    "Published"
                                );
                            }
                            Err(e) => {
                                rejected += 1;
                                if self.reject(&queue_tx, ServerFrame::rejected(&e)) {
                                    break CloseReason::Rejected;
                                }
                            }
                        }
                    }
                    Ok(Incoming::Malformed { code, reason }) => {
                        rejected += 1;
                        if self.reject(&queue_tx, ServerFrame::error(code, reason)) {
                            break CloseReason::Rejected;
                        }
                    }
                    Ok(Incoming::Closed) => {
                        info!(connection = %self.id, "Client disconnected");
                        break CloseReason::ClientClosed;
                    }
                    Err(e) => {
                        error!(connection = %self.id, error = %e, "Transport error");
                        break CloseReason::TransportFault(e.to_string());
                    }
                }
            }
        };

        self.broadcaster.leave(joined.handle);
        self.transition(SessionState::Closed);
        drop(queue_tx);

        if !writer_done {
            if matches!(reason, CloseReason::TransportFault(_)) {
                writer.abort();
            } else if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
                debug!(connection = %self.id, "Outbound drain timed out");
                writer.abort();
            }
        }

        SessionSummary {
            connection_id: self.id,
            reason,
            state: self.state,
            replayed: joined.replayed,
            published,
            rejected,
        }
    }

    /// Apply the malformed-payload policy. Returns `true` if the session must close.
    fn reject(&self, queue: &mpsc::Sender<Arc<ServerFrame>>, report: ServerFrame) -> bool {
        warn!(connection = %self.id, frame = ?report, "Rejected inbound payload");

        let report_back = |frame: ServerFrame| {
            if queue.try_send(Arc::new(frame)).is_err() {
                warn!(connection = %self.id, "Outbound queue full, error report dropped");
            }
        };

        match self.config.malformed_policy {
            MalformedPolicy::Report => {
                report_back(report);
                false
            }
            MalformedPolicy::Ignore => false,
            MalformedPolicy::Disconnect => {
                report_back(report);
                true
            }
        }
    }
}

/// Drain the outbound queue into the transport, closing it once the queue ends.
async fn write_loop<S: FrameSender>(
    id: ConnectionId,
    mut sender: S,
    mut queue: mpsc::Receiver<Arc<ServerFrame>>,
) -> Result<(), TransportError> {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = sender.send(&frame).await {
            debug!(connection = %id, frame = frame.kind(), error = %e, "Outbound send failed");
            return Err(e);
        }
    }
    sender.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastConfig;
    use relay_protocol::error_codes;
    use relay_transport::memory::{self, MemoryClient};
    use tokio::task::JoinHandle;

    fn spawn_session(
        broadcaster: &Arc<Broadcaster>,
        id: &str,
        config: SessionConfig,
    ) -> (JoinHandle<SessionSummary>, MemoryClient) {
        let (sender, receiver, client) = memory::channel();
        let session = Session::new(id.into(), Arc::clone(broadcaster), config);
        (tokio::spawn(session.run(sender, receiver)), client)
    }

    async fn next_content(client: &mut MemoryClient) -> String {
        match client.recv().await {
            Some(ServerFrame::Message { content, .. }) => content,
            other => panic!("expected message frame, got {:?}", other),
        }
    }

    async fn wait_for_receivers(broadcaster: &Broadcaster, n: usize) {
        while broadcaster.registry().len() != n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_two_sessions_both_receive_including_echo() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (_h1, mut c1) = spawn_session(&broadcaster, "s1", SessionConfig::default());
        let (_h2, mut c2) = spawn_session(&broadcaster, "s2", SessionConfig::default());
        wait_for_receivers(&broadcaster, 2).await;

        c1.submit("x", "a");

        assert_eq!(next_content(&mut c1).await, "x");
        assert_eq!(next_content(&mut c2).await, "x");
        assert_eq!(broadcaster.history(10).len(), 1);
    }

    #[tokio::test]
    async fn test_replay_before_live_traffic() {
        let broadcaster = Arc::new(Broadcaster::new());
        for i in 1..=12 {
            broadcaster.publish(format!("m{i}"), "old");
        }

        let (_handle, mut client) = spawn_session(&broadcaster, "late", SessionConfig::default());
        wait_for_receivers(&broadcaster, 1).await;
        broadcaster.publish("live", "new");

        for i in 3..=12 {
            assert_eq!(next_content(&mut client).await, format!("m{i}"));
        }
        assert_eq!(next_content(&mut client).await, "live");
    }

    #[tokio::test]
    async fn test_malformed_reported_to_sender_only() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (_h1, mut bad) = spawn_session(&broadcaster, "bad", SessionConfig::default());
        let (_h2, mut other) = spawn_session(&broadcaster, "other", SessionConfig::default());
        wait_for_receivers(&broadcaster, 2).await;

        bad.send_text("{not json");
        bad.send_text(r#"{"content":"ok","sender":"  "}"#);

        match bad.recv().await {
            Some(ServerFrame::Error { code, .. }) => assert_eq!(code, error_codes::MALFORMED),
            other => panic!("expected error frame, got {:?}", other),
        }
        match bad.recv().await {
            Some(ServerFrame::Error { code, .. }) => assert_eq!(code, error_codes::INVALID),
            other => panic!("expected error frame, got {:?}", other),
        }

        // Session is still alive and nothing was broadcast
        bad.submit("fine", "b");
        assert_eq!(next_content(&mut bad).await, "fine");
        assert_eq!(next_content(&mut other).await, "fine");
        assert_eq!(broadcaster.history(10).len(), 1);
    }

    #[tokio::test]
    async fn test_ignore_policy_is_silent() {
        let broadcaster = Arc::new(Broadcaster::new());
        let config = SessionConfig {
            malformed_policy: MalformedPolicy::Ignore,
            ..Default::default()
        };
        let (_handle, mut client) = spawn_session(&broadcaster, "s", config);

        client.send_text("garbage");
        client.submit("after", "a");
        assert_eq!(next_content(&mut client).await, "after");
    }

    #[tokio::test]
    async fn test_disconnect_policy_closes_session() {
        let broadcaster = Arc::new(Broadcaster::new());
        let config = SessionConfig {
            malformed_policy: MalformedPolicy::Disconnect,
            ..Default::default()
        };
        let (handle, mut client) = spawn_session(&broadcaster, "s", config);

        client.send_text("garbage");
        let summary = handle.await.unwrap();

        assert_eq!(summary.reason, CloseReason::Rejected);
        assert_eq!(summary.rejected, 1);
        assert!(matches!(client.recv().await, Some(ServerFrame::Error { .. })));
        assert_eq!(client.recv().await, None);
        assert!(client.is_closed_by_server());
        assert!(broadcaster.registry().is_empty());
    }

    #[tokio::test]
    async fn test_client_close_unregisters() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (handle, mut client) = spawn_session(&broadcaster, "s", SessionConfig::default());
        wait_for_receivers(&broadcaster, 1).await;

        client.submit("one", "a");
        assert_eq!(next_content(&mut client).await, "one");
        client.close();

        let summary = handle.await.unwrap();
        assert_eq!(summary.reason, CloseReason::ClientClosed);
        assert_eq!(summary.state, SessionState::Closed);
        assert_eq!(summary.published, 1);
        assert!(broadcaster.registry().is_empty());
    }

    #[tokio::test]
    async fn test_transport_fault_unregisters() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (handle, client) = spawn_session(&broadcaster, "s", SessionConfig::default());

        client.fail("connection reset");
        let summary = handle.await.unwrap();

        assert!(summary.reason.is_fault());
        assert!(broadcaster.registry().is_empty());
    }

    #[tokio::test]
    async fn test_own_send_failure_closes_only_that_session() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (dead_handle, mut dead) = spawn_session(&broadcaster, "dead", SessionConfig::default());
        let (_h, mut alive) = spawn_session(&broadcaster, "alive", SessionConfig::default());
        wait_for_receivers(&broadcaster, 2).await;

        dead.stop_reading();
        let published = broadcaster.publish("x", "a");
        assert_eq!(published.message.content, "x");

        let summary = dead_handle.await.unwrap();
        assert!(matches!(summary.reason, CloseReason::SendFailed(_)));

        assert_eq!(next_content(&mut alive).await, "x");
        wait_for_receivers(&broadcaster, 1).await;
    }

    #[tokio::test]
    async fn test_small_queue_still_fits_replay() {
        let broadcaster = Arc::new(Broadcaster::with_config(BroadcastConfig {
            history_capacity: 100,
            replay_count: 10,
        }));
        for i in 0..10 {
            broadcaster.publish(format!("m{i}"), "a");
        }
        let config = SessionConfig {
            outbound_capacity: 1,
            ..Default::default()
        };

        let (handle, mut client) = spawn_session(&broadcaster, "s", config);
        for i in 0..10 {
            assert_eq!(next_content(&mut client).await, format!("m{i}"));
        }
        client.close();
        assert_eq!(handle.await.unwrap().replayed, 10);
    }

    #[test]
    fn test_new_session_is_connecting() {
        let session = Session::new("s".into(), Arc::new(Broadcaster::new()), SessionConfig::default());
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.id().as_str(), "s");
    }
}
