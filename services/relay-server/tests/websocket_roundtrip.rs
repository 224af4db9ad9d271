//! Drives all five roles through the real router over a loopback socket
//! bound to an OS-assigned port, the same harness shape as the teacher's
//! `services/receiver/tests/session_loop.rs` (`TcpListener::bind("127.0.0.1:0")`
//! + a `tokio_tungstenite` client), pointed at `relay_server::build_router`
//! instead of a hand-rolled protocol responder.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_protocol::{
    GpsFix, Handshake, Motion, Orientation, SenderMessage, SensorFrame, ServerMessage,
};
use relay_server::config::Config;
use relay_server::state::AppState;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn test_config() -> Config {
    Config {
        port: 0,
        bind_addr: "127.0.0.1:0".to_owned(),
        max_senders: 2,
        sender_timeout: Duration::from_secs(120),
        batch_interval: Duration::from_secs(60),
        max_batch_size: 3,
        write_queue_cap: 16,
        slow_consumer_deadline: Duration::from_millis(200),
        drain_deadline: Duration::from_secs(1),
        log_level: "error".to_owned(),
    }
}

async fn spawn_server(config: Config) -> (SocketAddr, AppState, JoinHandle<()>) {
    let state = AppState::new(config);
    let router = relay_server::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let task = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    (addr, state, task)
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let url = format!("ws://{addr}{path}");
    let (ws, _) = connect_async(url).await.expect("connect");
    ws
}

async fn recv_message(ws: &mut Client) -> ServerMessage {
    timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await.expect("stream open").expect("frame") {
                Message::Text(text) => {
                    return serde_json::from_str(&text).expect("valid ServerMessage");
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await
    .expect("message within deadline")
}

async fn send_json<T: Serialize>(ws: &mut Client, msg: &T) {
    ws.send(Message::Text(serde_json::to_string(msg).unwrap().into()))
        .await
        .expect("send");
}

async fn handshake(ws: &mut Client, username: &str) {
    send_json(
        ws,
        &SenderMessage::Handshake(Handshake {
            username: Some(username.to_owned()),
            device_id: None,
        }),
    )
    .await;
}

fn frame_with_motion() -> SensorFrame {
    SensorFrame {
        timestamp: chrono::Utc::now(),
        id: None,
        gps: Some(GpsFix {
            lat: 47.6,
            lon: -122.3,
            alt: None,
            accuracy: 5.0,
            speed: None,
            heading: None,
        }),
        orientation: None,
        motion: Some(Motion {
            ax: 0.1,
            ay: 0.2,
            az: 9.8,
        }),
        weather: None,
        objects_detected: None,
        photo_base64: None,
        audio_base64: None,
    }
}

fn frame_with_orientation() -> SensorFrame {
    SensorFrame {
        timestamp: chrono::Utc::now(),
        id: None,
        gps: None,
        orientation: Some(Orientation {
            alpha: 12.0,
            beta: 3.0,
            gamma: -4.0,
            compass: None,
        }),
        motion: None,
        weather: None,
        objects_detected: None,
        photo_base64: None,
        audio_base64: None,
    }
}

#[tokio::test]
async fn sender_is_welcomed_promoted_and_acked_and_listener_sees_the_frame() {
    let (addr, _state, _server) = spawn_server(test_config()).await;

    let mut listener = connect(addr, "/listener").await;
    assert!(matches!(
        recv_message(&mut listener).await,
        ServerMessage::ListenerConnected(_)
    ));
    assert!(matches!(recv_message(&mut listener).await, ServerMessage::Stats(_)));

    let mut sender = connect(addr, "/pocket-parrot").await;
    handshake(&mut sender, "alice").await;
    assert!(matches!(recv_message(&mut sender).await, ServerMessage::Welcome(_)));
    assert!(matches!(recv_message(&mut sender).await, ServerMessage::Promoted(_)));
    tokio::time::sleep(Duration::from_millis(30)).await; // let the session snapshot publish

    send_json(&mut sender, &SenderMessage::Data(frame_with_motion())).await;
    assert!(matches!(recv_message(&mut sender).await, ServerMessage::Ack(_)));

    match recv_message(&mut listener).await {
        ServerMessage::SensorData(frame) => assert!(frame.motion.is_some()),
        other => panic!("expected sensor_data, got {other:?}"),
    }
}

#[tokio::test]
async fn orientation_reading_reaches_only_the_orientation_listener() {
    let (addr, _state, _server) = spawn_server(test_config()).await;

    let mut orientation_listener = connect(addr, "/orientation").await;
    assert!(matches!(
        recv_message(&mut orientation_listener).await,
        ServerMessage::OrientationListenerConnected(_)
    ));

    let mut sender = connect(addr, "/pocket-parrot").await;
    handshake(&mut sender, "bob").await;
    let _ = recv_message(&mut sender).await; // welcome
    let _ = recv_message(&mut sender).await; // promoted
    tokio::time::sleep(Duration::from_millis(30)).await;

    send_json(&mut sender, &SenderMessage::Data(frame_with_orientation())).await;
    assert!(matches!(recv_message(&mut sender).await, ServerMessage::Ack(_)));

    match recv_message(&mut orientation_listener).await {
        ServerMessage::OrientationData(payload) => {
            assert_eq!(payload.orientation.alpha, 12.0);
        }
        other => panic!("expected orientation_data, got {other:?}"),
    }
}

#[tokio::test]
async fn orientation_banner_is_never_coalesced_by_a_concurrent_data_burst() {
    let (addr, _state, _server) = spawn_server(test_config()).await;

    let mut sender = connect(addr, "/pocket-parrot").await;
    handshake(&mut sender, "heidi").await;
    let _ = recv_message(&mut sender).await; // welcome
    let _ = recv_message(&mut sender).await; // promoted
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Connect the orientation listener, then immediately race an orientation
    // reading against it — the connect banner (§6) must still arrive first,
    // not get overwritten in the newest-wins slot before it's ever read.
    let mut orientation_listener = connect(addr, "/orientation").await;
    send_json(&mut sender, &SenderMessage::Data(frame_with_orientation())).await;
    assert!(matches!(recv_message(&mut sender).await, ServerMessage::Ack(_)));

    assert!(matches!(
        recv_message(&mut orientation_listener).await,
        ServerMessage::OrientationListenerConnected(_)
    ));
}

#[tokio::test]
async fn three_bulk_items_trigger_one_batch_to_the_bulk_listener() {
    let (addr, _state, _server) = spawn_server(test_config()).await;

    let mut bulk_listener = connect(addr, "/bulk").await;
    match recv_message(&mut bulk_listener).await {
        ServerMessage::BulkListenerConnected(payload) => assert_eq!(payload.max_batch_size, 3),
        other => panic!("expected bulk_listener_connected, got {other:?}"),
    }

    let mut sender = connect(addr, "/pocket-parrot").await;
    handshake(&mut sender, "carol").await;
    let _ = recv_message(&mut sender).await; // welcome
    let _ = recv_message(&mut sender).await; // promoted
    tokio::time::sleep(Duration::from_millis(30)).await;

    for _ in 0..3 {
        send_json(&mut sender, &SenderMessage::Data(frame_with_motion())).await;
        assert!(matches!(recv_message(&mut sender).await, ServerMessage::Ack(_)));
    }

    match recv_message(&mut bulk_listener).await {
        ServerMessage::BulkDataBatch(batch) => assert_eq!(batch.batch_size, 3),
        other => panic!("expected bulk_data_batch, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_data_frame_from_the_active_sender_is_rejected() {
    let (addr, _state, _server) = spawn_server(test_config()).await;

    let mut sender = connect(addr, "/pocket-parrot").await;
    handshake(&mut sender, "gail").await;
    let _ = recv_message(&mut sender).await; // welcome
    let _ = recv_message(&mut sender).await; // promoted
    tokio::time::sleep(Duration::from_millis(30)).await;

    sender
        .send(Message::Text("not json".into()))
        .await
        .expect("send");

    match recv_message(&mut sender).await {
        ServerMessage::Rejected(payload) => assert_eq!(payload.reason, "protocol_error"),
        other => panic!("expected rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn dashboard_receives_a_stats_snapshot_on_connect() {
    let (addr, _state, _server) = spawn_server(test_config()).await;

    let mut dashboard = connect(addr, "/dashboard").await;
    assert!(matches!(recv_message(&mut dashboard).await, ServerMessage::Stats(_)));
}

#[tokio::test]
async fn dashboard_is_closed_after_repeated_malformed_requests() {
    let (addr, _state, _server) = spawn_server(test_config()).await;

    let mut dashboard = connect(addr, "/dashboard").await;
    let _ = recv_message(&mut dashboard).await; // initial stats snapshot

    for _ in 0..8 {
        let _ = dashboard.send(Message::Text("not json".into())).await;
    }

    let result = timeout(RECV_TIMEOUT, dashboard.next()).await;
    match result {
        Ok(Some(Ok(_))) => panic!("connection should have closed after repeated violations"),
        Ok(Some(Err(_))) | Ok(None) => {}
        Err(_) => panic!("connection was never closed within the deadline"),
    }
}

#[tokio::test]
async fn second_sender_over_capacity_evicts_the_first() {
    let mut config = test_config();
    config.max_senders = 1;
    let (addr, _state, _server) = spawn_server(config).await;

    let mut first = connect(addr, "/pocket-parrot").await;
    handshake(&mut first, "dave").await;
    let _ = recv_message(&mut first).await; // welcome
    let _ = recv_message(&mut first).await; // promoted
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut second = connect(addr, "/pocket-parrot").await;
    handshake(&mut second, "erin").await;
    let _ = recv_message(&mut second).await; // welcome

    assert!(matches!(recv_message(&mut first).await, ServerMessage::Evicted(_)));
    assert!(matches!(recv_message(&mut second).await, ServerMessage::Promoted(_)));
}

#[tokio::test]
async fn graceful_shutdown_notifies_the_sender_and_then_refuses_new_connections() {
    let (addr, state, _server) = spawn_server(test_config()).await;

    let mut sender = connect(addr, "/pocket-parrot").await;
    handshake(&mut sender, "frank").await;
    let _ = recv_message(&mut sender).await; // welcome
    let _ = recv_message(&mut sender).await; // promoted

    relay_server::shutdown::run(state).await;

    assert!(matches!(
        recv_message(&mut sender).await,
        ServerMessage::ServerShutdown(_)
    ));
    assert!(connect_async(format!("ws://{addr}/pocket-parrot")).await.is_err());
}
