//! End-to-end tests against a live server over real WebSockets.

use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, error_codes, ServerFrame, Submission};
use relay_server::{handlers, AppState, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn start(config: Config) -> (SocketAddr, Arc<AppState>) {
    let state = Arc::new(AppState::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(handlers::serve(listener, Arc::clone(&state)));
    (addr, state)
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    client
}

async fn wait_for_receivers(state: &AppState, count: usize) {
    timeout(WAIT, async {
        while state.broadcaster.registry().len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("receivers did not register in time");
}

/// Next server frame, skipping control frames.
async fn next_frame(client: &mut Client) -> ServerFrame {
    loop {
        let msg = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            WsMessage::Text(text) => return codec::decode_json(&text).unwrap(),
            WsMessage::Binary(data) => return codec::decode_msgpack(&data).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected websocket message: {other:?}"),
        }
    }
}

fn submission_text(content: &str, sender: &str) -> WsMessage {
    WsMessage::Text(codec::encode_json(&Submission::new(content, sender)).unwrap())
}

#[tokio::test]
async fn test_message_reaches_every_session_including_sender() {
    let (addr, state) = start(Config::default()).await;

    let mut alice = connect(addr, "/ws").await;
    let mut bob = connect(addr, "/ws").await;
    wait_for_receivers(&state, 2).await;

    alice.send(submission_text("hello", "alice")).await.unwrap();

    for client in [&mut alice, &mut bob] {
        match next_frame(client).await {
            ServerFrame::Message { content, sender, .. } => {
                assert_eq!(content, "hello");
                assert_eq!(sender, "alice");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    assert_eq!(state.broadcaster.history(10).len(), 1);
}

#[tokio::test]
async fn test_new_session_receives_recent_history() {
    let (addr, state) = start(Config::default()).await;
    for i in 0..12 {
        state.broadcaster.publish(format!("m{i}"), "seed");
    }

    let mut client = connect(addr, "/ws").await;
    for i in 2..12 {
        match next_frame(&mut client).await {
            ServerFrame::Message { content, .. } => assert_eq!(content, format!("m{i}")),
            other => panic!("expected replayed message, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_malformed_payload_is_reported() {
    let (addr, state) = start(Config::default()).await;

    let mut client = connect(addr, "/ws").await;
    wait_for_receivers(&state, 1).await;

    client.send(WsMessage::Text("not json".into())).await.unwrap();
    match next_frame(&mut client).await {
        ServerFrame::Error { code, .. } => assert_eq!(code, error_codes::MALFORMED),
        other => panic!("expected error, got {other:?}"),
    }

    client.send(submission_text("still here", "carol")).await.unwrap();
    match next_frame(&mut client).await {
        ServerFrame::Message { content, .. } => assert_eq!(content, "still here"),
        other => panic!("expected message, got {other:?}"),
    }
    assert_eq!(state.broadcaster.history(10).len(), 1);
}

#[tokio::test]
async fn test_msgpack_session() {
    let (addr, state) = start(Config::default()).await;

    let mut client = connect(addr, "/ws?encoding=msgpack").await;
    wait_for_receivers(&state, 1).await;

    let payload = codec::encode_msgpack(&Submission::new("packed", "dave")).unwrap();
    client.send(WsMessage::Binary(payload.to_vec())).await.unwrap();

    let msg = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    let WsMessage::Binary(data) = msg else {
        panic!("expected binary frame, got {msg:?}");
    };
    match codec::decode_msgpack::<ServerFrame>(&data).unwrap() {
        ServerFrame::Message { content, .. } => assert_eq!(content, "packed"),
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_unregisters_receiver() {
    let (addr, state) = start(Config::default()).await;

    let mut client = connect(addr, "/ws").await;
    wait_for_receivers(&state, 1).await;

    client.close(None).await.unwrap();
    wait_for_receivers(&state, 0).await;

    let published = state.broadcaster.publish("anyone?", "eve");
    assert_eq!(published.delivered, 0);
}

#[tokio::test]
async fn test_heartbeat_endpoint() {
    let mut config = Config::default();
    config.heartbeat.interval_ms = 50;
    let (addr, state) = start(config).await;

    let mut client = connect(addr, "/heartbeat").await;
    for _ in 0..2 {
        assert_eq!(next_frame(&mut client).await, ServerFrame::Heartbeat);
    }

    // Heartbeat connections never join the broadcast
    assert_eq!(state.broadcaster.registry().len(), 0);
}

#[tokio::test]
async fn test_truncated_binary_is_reported_and_next_message_published() {
    let (addr, state) = start(Config::default()).await;

    let mut client = connect(addr, "/ws?encoding=msgpack").await;
    wait_for_receivers(&state, 1).await;

    // Length prefix promises 100 bytes, only 3 follow
    client
        .send(WsMessage::Binary(vec![0, 0, 0, 100, 1, 2, 3]))
        .await
        .unwrap();
    match next_frame(&mut client).await {
        ServerFrame::Error { code, .. } => assert_eq!(code, error_codes::MALFORMED),
        other => panic!("expected error, got {other:?}"),
    }

    let payload = codec::encode_msgpack(&Submission::new("valid", "alice")).unwrap();
    client.send(WsMessage::Binary(payload.to_vec())).await.unwrap();
    match next_frame(&mut client).await {
        ServerFrame::Message { content, .. } => assert_eq!(content, "valid"),
        other => panic!("expected message, got {other:?}"),
    }
    assert_eq!(state.broadcaster.history(10).len(), 1);
}

#[tokio::test]
async fn test_oversized_text_is_rejected_as_too_large() {
    let mut config = Config::default();
    config.limits.max_message_size = 8;
    let (addr, state) = start(config).await;

    let mut client = connect(addr, "/ws").await;
    wait_for_receivers(&state, 1).await;

    client
        .send(submission_text("far more than eight bytes", "alice"))
        .await
        .unwrap();
    match next_frame(&mut client).await {
        ServerFrame::Error { code, .. } => assert_eq!(code, error_codes::TOO_LARGE),
        other => panic!("expected error, got {other:?}"),
    }

    assert!(state.broadcaster.history(10).is_empty());
    assert_eq!(state.broadcaster.registry().len(), 1);
}

#[tokio::test]
async fn test_upgrade_refused_at_connection_limit() {
    let mut config = Config::default();
    config.limits.max_connections = 1;
    let (addr, state) = start(config).await;

    let mut first = connect(addr, "/ws").await;
    wait_for_receivers(&state, 1).await;

    match connect_async(format!("ws://{addr}/ws")).await {
        Err(Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
        Ok(_) => panic!("second session was accepted"),
        Err(e) => panic!("unexpected error: {e}"),
    }
    assert_eq!(state.broadcaster.registry().len(), 1);

    // The slot frees up once the first session ends
    first.close(None).await.unwrap();
    wait_for_receivers(&state, 0).await;
    timeout(WAIT, async {
        while state.slots.active() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slot was not released");

    let _second = connect(addr, "/ws").await;
    wait_for_receivers(&state, 1).await;
}
