use super::*;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;

const OPEN_FRAME: &str =
    r#"0{"sid":"engine-1","upgrades":[],"pingInterval":500,"pingTimeout":500,"maxPayload":1000000}"#;

#[derive(Clone)]
struct ServerState {
    connections: Arc<AtomicUsize>,
    script: Arc<Vec<String>>,
    drop_first_connection: bool,
    received: mpsc::UnboundedSender<String>,
}

async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(state, socket))
}

async fn serve_socket(state: ServerState, mut socket: WebSocket) {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    if socket
        .send(WsMessage::Text(OPEN_FRAME.to_string()))
        .await
        .is_err()
    {
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        if let WsMessage::Text(text) = msg {
            if text == "40" {
                break;
            }
        }
    }
    if socket
        .send(WsMessage::Text(r#"40{"sid":"socket-1"}"#.to_string()))
        .await
        .is_err()
    {
        return;
    }

    if state.drop_first_connection && connection == 1 {
        let _ = socket.close().await;
        return;
    }

    for frame in state.script.iter() {
        if socket.send(WsMessage::Text(frame.clone())).await.is_err() {
            return;
        }
    }

    while let Some(Ok(msg)) = socket.recv().await {
        if let WsMessage::Text(text) = msg {
            let _ = state.received.send(text);
        }
    }
}

async fn spawn_socket_server(
    script: Vec<&str>,
    drop_first_connection: bool,
) -> (String, Arc<AtomicUsize>, mpsc::UnboundedReceiver<String>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let (received_tx, received_rx) = mpsc::unbounded_channel();
    let state = ServerState {
        connections: Arc::clone(&connections),
        script: Arc::new(script.into_iter().map(str::to_string).collect()),
        drop_first_connection,
        received: received_tx,
    };
    let app = Router::new()
        .route("/socket.io/", get(socket_handler))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), connections, received_rx)
}

fn fast_settings(backend_url: String) -> Settings {
    Settings {
        backend_url,
        reconnect_initial_delay_ms: 20,
        reconnect_max_delay_ms: 50,
        ..Settings::default()
    }
}

async fn next_event(inbound: &mut Inbound) -> InboundEvent {
    tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

#[tokio::test]
async fn delivers_connect_then_events_in_order() {
    let (url, _connections, _received) = spawn_socket_server(
        vec![
            r#"42["sensor_data",{"text":"New tab","type":"file_sensor"}]"#,
            r#"42["chat_reply",{"message":"hello"}]"#,
        ],
        false,
    )
    .await;
    let (transport, mut inbound) = SocketTransport::connect(&fast_settings(url)).expect("connect");

    assert!(matches!(next_event(&mut inbound).await, InboundEvent::Connect));
    assert!(matches!(
        next_event(&mut inbound).await,
        InboundEvent::SensorData(data) if data.text == "New tab"
    ));
    assert!(matches!(
        next_event(&mut inbound).await,
        InboundEvent::ChatReply(reply) if reply.message == "hello"
    ));
    assert_eq!(transport.state(), LinkState::Connected);

    transport.shutdown().await;
    assert_eq!(transport.state(), LinkState::Closed);
}

#[tokio::test]
async fn malformed_payloads_are_dropped_without_breaking_the_link() {
    let (url, _connections, _received) = spawn_socket_server(
        vec![
            r#"42["analysis_result",{"actions":"nope"}]"#,
            r#"42["chat_reply",{"message":"still here"}]"#,
        ],
        false,
    )
    .await;
    let (transport, mut inbound) = SocketTransport::connect(&fast_settings(url)).expect("connect");

    assert!(matches!(next_event(&mut inbound).await, InboundEvent::Connect));
    assert!(matches!(
        next_event(&mut inbound).await,
        InboundEvent::ChatReply(reply) if reply.message == "still here"
    ));
    transport.shutdown().await;
}

#[tokio::test]
async fn emits_outbound_events_as_socket_io_frames() {
    let (url, _connections, mut received) = spawn_socket_server(Vec::new(), false).await;
    let (transport, mut inbound) = SocketTransport::connect(&fast_settings(url)).expect("connect");
    assert!(matches!(next_event(&mut inbound).await, InboundEvent::Connect));

    transport
        .emit(OutboundEvent::ChatMessage {
            message: "how am I doing?".to_string(),
        })
        .expect("emit");

    let frame = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("frame in time")
        .expect("frame");
    assert_eq!(frame, r#"42["chat_message",{"message":"how am I doing?"}]"#);
    transport.shutdown().await;
}

#[tokio::test]
async fn shutdown_flushes_queued_events_then_disconnects() {
    let (url, _connections, mut received) = spawn_socket_server(Vec::new(), false).await;
    let (transport, mut inbound) = SocketTransport::connect(&fast_settings(url)).expect("connect");
    assert!(matches!(next_event(&mut inbound).await, InboundEvent::Connect));

    transport
        .emit(OutboundEvent::AdjustTolerance {
            risk_type: "sedentary".to_string(),
            amount: 0.5,
        })
        .expect("emit");
    transport.shutdown().await;

    let mut frames = Vec::new();
    while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_secs(2), received.recv()).await {
        frames.push(frame);
    }
    assert_eq!(
        frames,
        vec![
            r#"42["adjust_tolerance",{"amount":0.5,"risk_type":"sedentary"}]"#.to_string(),
            "41".to_string(),
        ]
    );
}

#[tokio::test]
async fn answers_server_pings() {
    let (url, _connections, mut received) = spawn_socket_server(vec!["2"], false).await;
    let (transport, mut inbound) = SocketTransport::connect(&fast_settings(url)).expect("connect");
    assert!(matches!(next_event(&mut inbound).await, InboundEvent::Connect));

    let frame = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("pong in time")
        .expect("pong");
    assert_eq!(frame, "3");
    transport.shutdown().await;
}

#[tokio::test]
async fn reconnects_after_the_server_drops_the_link() {
    let (url, connections, _received) =
        spawn_socket_server(vec![r#"42["chat_reply",{"message":"back"}]"#], true).await;
    let (transport, mut inbound) = SocketTransport::connect(&fast_settings(url)).expect("connect");

    assert!(matches!(next_event(&mut inbound).await, InboundEvent::Connect));
    assert!(matches!(next_event(&mut inbound).await, InboundEvent::Connect));
    assert!(matches!(
        next_event(&mut inbound).await,
        InboundEvent::ChatReply(reply) if reply.message == "back"
    ));
    assert!(connections.load(Ordering::SeqCst) >= 2);
    transport.shutdown().await;
}

#[tokio::test]
async fn silent_link_is_redialed_even_while_emitting() {
    let (url, connections, _received) = spawn_socket_server(Vec::new(), false).await;
    let (transport, mut inbound) = SocketTransport::connect(&fast_settings(url)).expect("connect");
    assert!(matches!(next_event(&mut inbound).await, InboundEvent::Connect));

    // liveness window is 1s; keep writing well past it
    let mut redialed = false;
    for _ in 0..12 {
        transport
            .emit(OutboundEvent::ChatMessage {
                message: "anyone there?".to_string(),
            })
            .expect("emit");
        if let Ok(Some(InboundEvent::Connect)) =
            tokio::time::timeout(Duration::from_millis(250), inbound.recv()).await
        {
            redialed = true;
            break;
        }
    }

    assert!(redialed, "silent link was never declared dead");
    assert!(connections.load(Ordering::SeqCst) >= 2);
    transport.shutdown().await;
}

#[tokio::test]
async fn shutdown_during_backoff_discards_queued_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let settings = Settings {
        reconnect_initial_delay_ms: 5_000,
        reconnect_max_delay_ms: 5_000,
        ..fast_settings(format!("http://{addr}"))
    };
    let (transport, _inbound) = SocketTransport::connect(&settings).expect("connect");

    let mut state = transport.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == LinkState::Disconnected),
    )
    .await
    .expect("dial fails in time")
    .expect("state channel");

    transport
        .emit(OutboundEvent::ChatMessage {
            message: "queued".to_string(),
        })
        .expect("queued while disconnected");
    tokio::time::timeout(Duration::from_secs(1), transport.shutdown())
        .await
        .expect("shutdown does not wait out the back-off");

    assert_eq!(transport.state(), LinkState::Closed);
    assert!(matches!(
        transport.emit(OutboundEvent::ChatMessage {
            message: "late".to_string(),
        }),
        Err(TransportError::Closed)
    ));
}

#[tokio::test]
async fn emit_after_shutdown_reports_closed() {
    let (url, _connections, _received) = spawn_socket_server(Vec::new(), false).await;
    let (transport, mut inbound) = SocketTransport::connect(&fast_settings(url)).expect("connect");
    assert!(matches!(next_event(&mut inbound).await, InboundEvent::Connect));
    transport.shutdown().await;

    let err = transport
        .emit(OutboundEvent::ChatMessage {
            message: "late".to_string(),
        })
        .expect_err("must fail");
    assert!(matches!(err, TransportError::Closed));
}

#[test]
fn socket_url_maps_http_schemes() {
    assert_eq!(
        socket_url("http://localhost:8000").expect("url"),
        "ws://localhost:8000/socket.io/?EIO=4&transport=websocket"
    );
    assert_eq!(
        socket_url("https://vital.example").expect("url"),
        "wss://vital.example/socket.io/?EIO=4&transport=websocket"
    );
    assert!(matches!(
        socket_url("ftp://vital.example"),
        Err(TransportError::InvalidUrl(_))
    ));
    assert!(socket_url("not a url").is_err());
}

#[test]
fn backoff_doubles_up_to_the_cap_and_resets() {
    let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
    assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    assert_eq!(backoff.next_delay(), Duration::from_millis(350));
    assert_eq!(backoff.next_delay(), Duration::from_millis(350));
    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_millis(100));
}
