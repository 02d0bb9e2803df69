//! End-to-end tests against a real listener

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use ocpp_engine::{
    handlers, ActionRegistry, BootNotificationConfig, CentralSystem, ErrorCode, HandlerError,
    RequestError, ServerConfig, ServerError, SessionState,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        protocol::frame::coding::CloseCode,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

type Station = WebSocketStream<MaybeTlsStream<TcpStream>>;

const BOOT: &str =
    r#"[2, "123", "BootNotification", {"chargePointVendor": "Acme", "chargePointModel": "X1"}]"#;

struct TestServer {
    server: CentralSystem,
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<(), ServerError>>,
}

async fn start(config: ServerConfig) -> TestServer {
    start_with(config, handlers::default_registry(BootNotificationConfig::default())).await
}

async fn start_with(config: ServerConfig, registry: ActionRegistry) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = CentralSystem::new(config, registry);

    let (shutdown, signal) = oneshot::channel::<()>();
    let runner = server.clone();
    let task = tokio::spawn(async move {
        runner
            .run_until(listener, async {
                let _ = signal.await;
            })
            .await
    });

    TestServer {
        server,
        addr,
        shutdown,
        task,
    }
}

async fn connect(addr: SocketAddr, station_id: &str, protocol: &str) -> Result<Station, tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{}/{}", addr, station_id)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(protocol).unwrap());

    connect_async(request).await.map(|(ws, _)| ws)
}

async fn send_text(station: &mut Station, text: &str) {
    station.send(Message::Text(text.to_string().into())).await.unwrap();
}

async fn recv_json(station: &mut Station) -> Value {
    loop {
        match station.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("expected text frame, got {:?}", other),
        }
    }
}

/// Connect and complete a BootNotification so the session is registered
async fn booted(addr: SocketAddr, station_id: &str) -> Station {
    let mut station = connect(addr, station_id, "ocpp1.6").await.unwrap();
    send_text(&mut station, BOOT).await;
    let reply = recv_json(&mut station).await;
    assert_eq!(reply[0], 3);
    station
}

#[tokio::test]
async fn test_boot_notification_round_trip() {
    let ts = start(ServerConfig::default()).await;
    let mut station = connect(ts.addr, "CP1", "ocpp1.6").await.unwrap();

    send_text(&mut station, BOOT).await;
    let reply = recv_json(&mut station).await;

    assert_eq!(reply[0], 3);
    assert_eq!(reply[1], "123");
    assert_eq!(reply[2]["interval"], 10);
    assert_eq!(reply[2]["status"], "Accepted");
    assert!(reply[2]["currentTime"].as_str().unwrap().contains('T'));

    assert_eq!(ts.server.station_ids().await, vec!["CP1".to_string()]);
}

#[tokio::test]
async fn test_unknown_action_not_implemented() {
    let ts = start(ServerConfig::default()).await;
    let mut station = connect(ts.addr, "CP1", "ocpp1.6").await.unwrap();

    send_text(&mut station, r#"[2, "h1", "Heartbeat", {}]"#).await;
    let reply = recv_json(&mut station).await;

    assert_eq!(reply, json!([4, "h1", "NotImplemented", "Unknown action: Heartbeat", {}]));
}

#[tokio::test]
async fn test_subprotocol_mismatch_rejected() {
    let ts = start(ServerConfig::default()).await;

    match connect(ts.addr, "CP1", "ocpp2.0").await {
        // The client may refuse a handshake without the requested subprotocol.
        Err(_) => {}
        Ok(mut station) => match station.next().await {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {}
            other => panic!("expected close, got {:?}", other),
        },
    }

    assert!(ts.server.session("CP1").await.is_none());
}

#[tokio::test]
async fn test_station_id_from_path() {
    let ts = start(ServerConfig::default()).await;
    let _station = booted(ts.addr, "CP-0042").await;

    let handle = ts.server.session("CP-0042").await.unwrap();
    assert_eq!(handle.station_id(), "CP-0042");
    assert_eq!(handle.state(), SessionState::Open);
}

#[tokio::test]
async fn test_outbound_call_resolved() {
    let ts = start(ServerConfig::default()).await;
    let mut station = booted(ts.addr, "CP1").await;
    let handle = ts.server.session("CP1").await.unwrap();

    let pending = handle
        .send("ChangeConfiguration", json!({"key": "HeartbeatInterval", "value": "60"}))
        .await
        .unwrap();

    let call = recv_json(&mut station).await;
    assert_eq!(call[0], 2);
    assert_eq!(call[1], pending.message_id());
    assert_eq!(call[2], "ChangeConfiguration");
    assert_eq!(call[3]["value"], "60");

    send_text(&mut station, &json!([3, call[1], {"status": "Accepted"}]).to_string()).await;
    assert_eq!(assert_ok!(pending.await), json!({"status": "Accepted"}));
}

#[tokio::test]
async fn test_outbound_call_error_and_timeout() {
    let config = ServerConfig::default().with_request_timeout(Duration::from_millis(100));
    let ts = start(config).await;
    let mut station = booted(ts.addr, "CP1").await;
    let handle = ts.server.session("CP1").await.unwrap();

    let rejected = handle.send("Reset", json!({"type": "Hard"})).await.unwrap();
    let call = recv_json(&mut station).await;
    send_text(
        &mut station,
        &json!([4, call[1], "OccurenceConstraintViolation", "bad", {}]).to_string(),
    )
    .await;
    match rejected.await {
        Err(RequestError::Remote { code, .. }) => {
            assert_eq!(code, ErrorCode::OccurrenceConstraintViolation)
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let slow = handle.send("GetConfiguration", json!({})).await.unwrap();
    let call = recv_json(&mut station).await;
    assert_eq!(slow.await, Err(RequestError::Timeout));

    // Late and unknown responses are discarded, the session stays up.
    send_text(&mut station, &json!([3, call[1], {}]).to_string()).await;
    send_text(&mut station, r#"[3, "nobody-asked", {}]"#).await;
    send_text(&mut station, BOOT).await;
    assert_eq!(recv_json(&mut station).await[1], "123");
    assert_eq!(handle.state(), SessionState::Open);
}

#[tokio::test]
async fn test_reconnect_replaces_previous_session() {
    let ts = start(ServerConfig::default()).await;
    let mut first = booted(ts.addr, "CP1").await;
    let old = ts.server.session("CP1").await.unwrap();

    let pending = old.send("GetConfiguration", json!({})).await.unwrap();
    let _ = recv_json(&mut first).await;

    let _second = booted(ts.addr, "CP1").await;

    assert_eq!(pending.await, Err(RequestError::Cancelled));
    assert_eq!(old.state(), SessionState::Closed);

    let current = ts.server.session("CP1").await.unwrap();
    assert_ne!(current.connection_id(), old.connection_id());
    assert_eq!(ts.server.station_ids().await, vec!["CP1".to_string()]);

    match first.next().await {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_disconnect_removes_session() {
    let ts = start(ServerConfig::default()).await;
    let mut station = booted(ts.addr, "CP1").await;
    let handle = ts.server.session("CP1").await.unwrap();

    station.close(None).await.unwrap();
    handle.closed().await;

    // The directory entry goes away right after the session ends.
    for _ in 0..50 {
        if ts.server.session("CP1").await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ts.server.session("CP1").await.is_none());
    assert_err!(handle.send("Reset", json!({"type": "Soft"})).await);
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let ts = start(ServerConfig::default()).await;
    let mut station = booted(ts.addr, "CP1").await;
    let handle = ts.server.session("CP1").await.unwrap();

    ts.shutdown.send(()).unwrap();
    assert_ok!(ts.task.await.unwrap());

    assert_eq!(handle.state(), SessionState::Closed);
    assert!(ts.server.station_ids().await.is_empty());
    match station.next().await {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reconnect_after_handler_panic() {
    let mut registry = handlers::default_registry(BootNotificationConfig::default());
    registry.register("Boom", |_station: String, _req: Value| {
        if true {
            panic!("sync kaboom");
        }
        async { Ok::<Value, HandlerError>(Value::Null) }
    });
    let ts = start_with(ServerConfig::default(), registry).await;

    let mut first = booted(ts.addr, "CP1").await;
    send_text(&mut first, r#"[2, "b1", "Boom", {}]"#).await;
    let reply = recv_json(&mut first).await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[2], "InternalError");
    assert_eq!(ts.server.session("CP1").await.unwrap().state(), SessionState::Open);

    let mut second = connect(ts.addr, "CP1", "ocpp1.6").await.unwrap();
    send_text(&mut second, BOOT).await;
    let reply = tokio::time::timeout(Duration::from_secs(3), recv_json(&mut second))
        .await
        .unwrap();
    assert_eq!(reply[1], "123");
    assert_eq!(ts.server.station_ids().await, vec!["CP1".to_string()]);
}
