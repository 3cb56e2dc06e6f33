//! Per-connection heartbeat.
//!
//! Sends a fixed liveness marker on its own connection at a fixed period. It
//! never touches history or the receiver registry.

use crate::session::CloseReason;
use relay_protocol::ServerFrame;
use relay_transport::{ConnectionId, FrameReceiver, FrameSender, Incoming};
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Summary returned when a heartbeat connection ends.
#[derive(Debug, Clone)]
pub struct HeartbeatSummary {
    /// Liveness markers sent.
    pub beats: u64,
    /// Why the connection ended.
    pub reason: CloseReason,
}

/// Periodic liveness emitter.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
}

impl Heartbeat {
    /// Create an emitter with the given period (at least 1 ms).
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// The heartbeat period.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Emit heartbeats until the peer disconnects or a send fails.
    ///
    /// Inbound traffic is read only to notice the disconnect.
    pub async fn run<S, R>(&self, id: &ConnectionId, mut sender: S, mut receiver: R) -> HeartbeatSummary
    where
        S: FrameSender,
        R: FrameReceiver,
    {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut beats = 0;

        let reason = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = sender.send(&ServerFrame::Heartbeat).await {
                        warn!(connection = %id, error = %e, "Heartbeat send failed");
                        break CloseReason::SendFailed(e.to_string());
                    }
                    beats += 1;
                }
                incoming = receiver.recv() => match incoming {
                    Ok(Incoming::Closed) => {
                        info!(connection = %id, "Heartbeat peer disconnected");
                        break CloseReason::ClientClosed;
                    }
                    Ok(_) => {
                        // Nothing is expected inbound
                    }
                    Err(e) => {
                        warn!(connection = %id, error = %e, "Heartbeat transport error");
                        break CloseReason::TransportFault(e.to_string());
                    }
                }
            }
        };

        if let Err(e) = sender.close().await {
            debug!(connection = %id, error = %e, "Heartbeat close failed");
        }

        HeartbeatSummary { beats, reason }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}
