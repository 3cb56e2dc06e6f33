//! HTTP and WebSocket handlers for the relay server.
//!
//! Message sessions and heartbeat connections are upgraded here and handed to
//! `relay-core`; submit and history are plain JSON endpoints over the same
//! broadcaster.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use relay_core::{Broadcaster, Heartbeat, Message, Session};
use relay_protocol::{Encoding, Submission, ValidationError};
use relay_transport::{websocket, ConnectionId, WebSocketConfig};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Interval at which broadcaster statistics are exported.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The broadcast engine shared by every connection.
    pub broadcaster: Arc<Broadcaster>,
    /// Session slots, bounded by `limits.max_connections`.
    pub slots: Arc<SessionSlots>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            broadcaster: Arc::new(Broadcaster::with_config(config.broadcast_config())),
            slots: Arc::new(SessionSlots::new(config.limits.max_connections)),
            config,
        }
    }
}

/// Counts message sessions from upgrade until the session ends.
#[derive(Debug)]
pub struct SessionSlots {
    active: AtomicUsize,
    max: usize,
}

impl SessionSlots {
    /// Create a counter allowing at most `max` concurrent sessions.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max,
        }
    }

    /// Reserve a slot, or `None` if all are taken.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| SlotGuard(Arc::clone(self)))
    }

    /// Slots currently held.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// A reserved session slot, released on drop.
#[derive(Debug)]
pub struct SlotGuard(Arc<SessionSlots>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Errors returned by the HTTP endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Body was not a submission.
    #[error("malformed request body: {0}")]
    Malformed(String),

    /// Submission failed validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// Connection limit reached.
    #[error("too many connections")]
    TooManyConnections,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Malformed(_) => StatusCode::BAD_REQUEST,
            ApiError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::TooManyConnections => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let transport = &state.config.transport;
    Router::new()
        .route(&transport.websocket_path, get(ws_handler))
        .route(&transport.heartbeat_path, get(heartbeat_handler))
        .route("/messages", get(history_handler).post(submit_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&state))
}

/// Serve the application on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        metrics::spawn_stats_reporter(Arc::clone(&state.broadcaster), STATS_INTERVAL);
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoints: ws://{}{} ws://{}{}",
        addr, config.transport.websocket_path, addr, config.transport.heartbeat_path
    );

    serve(listener, state).await
}

/// Query parameters accepted on WebSocket upgrades.
#[derive(Debug, Default, Deserialize)]
struct UpgradeParams {
    #[serde(default)]
    encoding: Encoding,
}

/// Query parameters for history reads.
#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    limit: Option<i64>,
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.broadcaster.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "receivers": stats.receivers,
        "history": stats.history_len,
    }))
}

/// Accept a submission over HTTP and broadcast it.
async fn submit_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Submission>, JsonRejection>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let start = Instant::now();

    let Json(submission) = body.map_err(|e| {
        metrics::record_http_rejection();
        ApiError::Malformed(e.body_text())
    })?;

    if let Err(e) = submission.validate(state.config.limits.max_message_size) {
        metrics::record_http_rejection();
        debug!(error = %e, "Rejected HTTP submission");
        return Err(e.into());
    }

    let published = state
        .broadcaster
        .publish(submission.content, submission.sender);
    if !published.fully_delivered() {
        warn!(
            id = %published.message.id,
            dropped = published.dropped,
            "HTTP submission not delivered to every receiver"
        );
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
    Ok((StatusCode::CREATED, Json(Message::clone(&published.message))))
}

/// Return the most recent messages, oldest first.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<Message>> {
    let limit = params.limit.unwrap_or(state.config.history.default_limit);
    // Non-positive limits select nothing
    let limit = usize::try_from(limit).unwrap_or(0);

    let messages = state
        .broadcaster
        .history(limit)
        .iter()
        .map(|m| m.as_ref().clone())
        .collect();
    Json(messages)
}

/// WebSocket upgrade handler for message sessions.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<UpgradeParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    // Held from here until the session ends, or dropped with the closure
    // if the upgrade never completes
    let Some(slot) = state.slots.try_acquire() else {
        warn!("Connection limit reached, refusing session");
        return ApiError::TooManyConnections.into_response();
    };

    ws.on_upgrade(move |socket| async move {
        let _slot = slot;
        let _metrics_guard = ConnectionMetricsGuard::new("session");
        let id = ConnectionId::generate();
        let ws_config = WebSocketConfig {
            encoding: params.encoding,
            max_message_size: state.config.limits.max_message_size,
        };

        debug!(connection = %id, encoding = ?params.encoding, "Session connected");

        let (sender, receiver) = websocket::split(socket, &ws_config);
        let session = Session::new(id, Arc::clone(&state.broadcaster), state.config.session_config());
        let summary = session.run(sender, receiver).await;

        metrics::record_session(&summary);
    })
}

/// WebSocket upgrade handler for heartbeat connections.
async fn heartbeat_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<UpgradeParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let _metrics_guard = ConnectionMetricsGuard::new("heartbeat");
        let id = ConnectionId::generate();
        let ws_config = WebSocketConfig {
            encoding: params.encoding,
            max_message_size: state.config.limits.max_message_size,
        };

        debug!(connection = %id, "Heartbeat connected");

        let (sender, receiver) = websocket::split(socket, &ws_config);
        let summary = Heartbeat::new(state.config.heartbeat_interval())
            .run(&id, sender, receiver)
            .await;

        debug!(connection = %id, beats = summary.beats, "Heartbeat closed");
        metrics::record_heartbeat(&summary);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use tower::ServiceExt;

    fn app() -> (Router, Arc<AppState>) {
        let state = Arc::new(AppState::new(Config::default()));
        (build_router(Arc::clone(&state)), state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_message(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/messages")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_returns_created_message() {
        let (app, state) = app();

        let response = app
            .oneshot(post_message(r#"{"content":"hi","sender":"alice"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = body_json(response).await;
        assert_eq!(body["content"], "hi");
        assert_eq!(body["sender"], "alice");
        assert!(body["id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(body["timestamp"].as_u64().is_some());

        let stored = state.broadcaster.history(10);
        assert_eq!(stored.len(), 1);
        assert_eq!(body["id"], stored[0].id.as_str());
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid() {
        let (app, state) = app();

        let response = app
            .clone()
            .oneshot(post_message(r#"{"content":"hi","sender":"  "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(response).await["error"].is_string());

        let response = app
            .oneshot(post_message(r#"{"content":"","sender":"bob"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        assert!(state.broadcaster.history(10).is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_malformed_body() {
        let (app, state) = app();

        let response = app.oneshot(post_message("not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.broadcaster.history(10).is_empty());
    }

    #[tokio::test]
    async fn test_history_oldest_first() {
        let (app, state) = app();
        for i in 0..3 {
            state.broadcaster.publish(format!("m{i}"), "alice");
        }

        let response = app.oneshot(get("/messages?limit=2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let contents: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(contents, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_history_default_and_non_positive_limit() {
        let (app, state) = app();
        for i in 0..15 {
            state.broadcaster.publish(format!("m{i}"), "alice");
        }

        let response = app.clone().oneshot(get("/messages")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 10);
        assert_eq!(body[0]["content"], "m5");

        for uri in ["/messages?limit=0", "/messages?limit=-3"] {
            let response = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_json(response).await, serde_json::json!([]));
        }
    }

    #[tokio::test]
    async fn test_submit_then_history() {
        let (app, _state) = app();

        let created = body_json(
            app.clone()
                .oneshot(post_message(r#"{"content":"hello","sender":"carol"}"#))
                .await
                .unwrap(),
        )
        .await;

        let history = body_json(app.oneshot(get("/messages?limit=1")).await.unwrap()).await;
        assert_eq!(history[0], created);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, state) = app();
        state.broadcaster.publish("x", "y");

        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["receivers"], 0);
        assert_eq!(body["history"], 1);
    }

    #[test]
    fn test_session_slots_are_bounded() {
        let slots = Arc::new(SessionSlots::new(2));

        let first = slots.try_acquire();
        let second = slots.try_acquire();
        assert!(first.is_some() && second.is_some());
        assert!(slots.try_acquire().is_none());
        assert_eq!(slots.active(), 2);

        drop(first);
        assert_eq!(slots.active(), 1);
        assert!(slots.try_acquire().is_some());
    }

    #[test]
    fn test_zero_slots_refuse_everything() {
        let slots = Arc::new(SessionSlots::new(0));
        assert!(slots.try_acquire().is_none());
    }

    #[test]
    fn test_api_error_status() {
        assert_eq!(
            ApiError::Invalid(ValidationError::EmptySender).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::TooManyConnections.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
