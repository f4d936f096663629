//! OpenPulsar client against a local tungstenite server.

use base64::{Engine as _, engine::general_purpose};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tuyalink::cloud::types::DataPointValue;
use tuyalink::crypto::TuyaCipher;
use tuyalink::pulsar::derive_password;
use tuyalink::{CloudConfig, Endpoint, OpenPulsar, PulsarEvent};

const ACCESS_ID: &str = "akid0123";
const SECRET: &str = "secret0123456789abcdefgh";
const WAIT: Duration = Duration::from_secs(5);

fn wrap(event: &Value, message_id: &str) -> String {
    let cipher = TuyaCipher::new(&SECRET.as_bytes()[8..24]).unwrap();
    let data = cipher
        .encrypt(event.to_string().as_bytes(), true, true)
        .unwrap();
    let middle = json!({"data": String::from_utf8(data).unwrap(), "pv": "2.0", "t": 1});
    json!({
        "messageId": message_id,
        "payload": general_purpose::STANDARD.encode(middle.to_string()),
        "properties": {}
    })
    .to_string()
}

/// A message whose outer and middle layers are fine but whose ciphertext is not.
fn wrap_corrupted(event: &Value, message_id: &str) -> String {
    let cipher = TuyaCipher::new(&SECRET.as_bytes()[8..24]).unwrap();
    let mut data = cipher.encrypt(event.to_string().as_bytes(), false, true).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xff;
    let middle = json!({"data": general_purpose::STANDARD.encode(&data), "pv": "2.0", "t": 1});
    json!({
        "messageId": message_id,
        "payload": general_purpose::STANDARD.encode(middle.to_string()),
    })
    .to_string()
}

struct Handshake {
    path: String,
    username: String,
    password: String,
}

async fn accept(
    listener: &TcpListener,
) -> (WebSocketStream<tokio::net::TcpStream>, Handshake) {
    let (tcp, _) = listener.accept().await.unwrap();
    let (tx, rx) = oneshot::channel();
    let ws = accept_hdr_async(tcp, move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let _ = tx.send(Handshake {
            path: req
                .uri()
                .path_and_query()
                .map(|p| p.to_string())
                .unwrap_or_default(),
            username: header("username"),
            password: header("password"),
        });
        Ok(resp)
    })
    .await
    .unwrap();
    (ws, rx.await.unwrap())
}

fn config(addr: SocketAddr) -> CloudConfig {
    CloudConfig::new(ACCESS_ID, SECRET).with_endpoint(Endpoint::Custom {
        openapi: "http://127.0.0.1:1".into(),
        pulsar: format!("ws://{}/", addr),
    })
}

async fn next_event<S>(events: &mut S) -> PulsarEvent
where
    S: futures_util::Stream<Item = PulsarEvent> + Unpin,
{
    tokio::time::timeout(WAIT, events.next())
        .await
        .expect("event in time")
        .expect("stream open")
}

#[tokio::test]
async fn test_events_acks_and_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<Value>();

    let server = tokio::spawn(async move {
        let (mut ws, handshake) = accept(&listener).await;
        ws.send(Message::Text(
            wrap(
                &json!({"devId": "dev1", "status": [{"code": "switch_1", "value": true, "1": true}]}),
                "m1",
            )
            .into(),
        ))
        .await
        .unwrap();
        // Garbage payload: acked, then dropped.
        ws.send(Message::Text(
            json!({"messageId": "m2", "payload": "bm90IGpzb24="}).to_string().into(),
        ))
        .await
        .unwrap();
        // Bad inner ciphertext: acked, dropped, socket stays open.
        ws.send(Message::Text(
            wrap_corrupted(&json!({"devId": "dev1", "status": []}), "m3").into(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(
            wrap(&json!({"bizCode": "offline", "devId": "dev1", "bizData": {}}), "m4").into(),
        ))
        .await
        .unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let _ = ack_tx.send(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        handshake
    });

    let pulsar = OpenPulsar::new(config(addr));
    let mut events = Box::pin(pulsar.subscribe());
    pulsar.connect().await.unwrap();
    assert!(pulsar.is_connected());
    assert!(pulsar.session().last_connect_attempt.is_some());

    match next_event(&mut events).await {
        PulsarEvent::DeviceStatus { dev_id, status } => {
            assert_eq!(dev_id, "dev1");
            assert_eq!(status[0].code, "switch_1");
            assert_eq!(status[0].value, Some(DataPointValue::Bool(true)));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        next_event(&mut events).await,
        PulsarEvent::DeviceState {
            dev_id: "dev1".into(),
            online: false
        }
    );

    let mut acks = Vec::new();
    for _ in 0..4 {
        let ack = tokio::time::timeout(WAIT, ack_rx.recv()).await.unwrap().unwrap();
        acks.push(ack["messageId"].as_str().unwrap().to_string());
    }
    assert_eq!(acks, ["m1", "m2", "m3", "m4"]);
    assert!(pulsar.is_connected());

    pulsar.disconnect().await;
    assert_eq!(next_event(&mut events).await, PulsarEvent::Disconnected);
    pulsar.disconnect().await;
    let session = pulsar.session();
    assert!(!session.connected);
    assert!(session.disconnected_at.is_some());
    assert!(session.lost_at.is_none());

    let handshake = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(
        handshake.path,
        format!(
            "/ws/v2/consumer/persistent/{id}/out/event/{id}-sub?ackTimeoutMillis=3000&subscriptionType=Failover",
            id = ACCESS_ID
        )
    );
    assert_eq!(handshake.username, ACCESS_ID);
    assert_eq!(handshake.password, derive_password(ACCESS_ID, SECRET));
}

#[tokio::test]
async fn test_server_close_is_reported_as_lost() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        let _ = ws.close(None).await;
    });

    let pulsar = OpenPulsar::new(config(addr));
    let mut events = Box::pin(pulsar.subscribe());
    pulsar.connect().await.unwrap();

    assert_eq!(next_event(&mut events).await, PulsarEvent::Lost);
    let session = pulsar.session();
    assert!(!session.connected);
    assert!(session.lost_at.is_some());
    // Nothing left to disconnect; no Disconnected event follows.
    pulsar.disconnect().await;
    assert!(pulsar.session().disconnected_at.is_none());
}

#[tokio::test]
async fn test_ping_keepalive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ping_tx, ping_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        let mut ping_tx = Some(ping_tx);
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_ping() {
                if let Some(tx) = ping_tx.take() {
                    let _ = tx.send(());
                }
            }
        }
    });

    let pulsar = OpenPulsar::new(config(addr).with_ping_interval(Duration::from_millis(100)));
    pulsar.connect().await.unwrap();
    tokio::time::timeout(WAIT, ping_rx).await.unwrap().unwrap();
    pulsar.disconnect().await;
}

#[tokio::test]
async fn test_connect_failure_keeps_session_idle() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let pulsar = OpenPulsar::new(config(addr));
    assert!(pulsar.connect().await.is_err());
    let session = pulsar.session();
    assert!(!session.connected);
    assert!(!session.connecting);
    assert!(session.last_connect_attempt.is_some());
}

#[tokio::test]
async fn test_disconnect_during_handshake_aborts_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = tokio_tungstenite::accept_async(tcp).await;
    });

    let pulsar = OpenPulsar::new(config(addr));
    let mut events = Box::pin(pulsar.subscribe());
    let connecting = {
        let pulsar = pulsar.clone();
        tokio::spawn(async move { pulsar.connect().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pulsar.session().connecting);
    pulsar.disconnect().await;
    assert_eq!(next_event(&mut events).await, PulsarEvent::Disconnected);

    let result = tokio::time::timeout(WAIT, connecting).await.unwrap().unwrap();
    assert!(matches!(result, Err(tuyalink::TuyaError::Offline)));
    tokio::time::sleep(Duration::from_millis(400)).await;
    let session = pulsar.session();
    assert!(!session.connecting);
    assert!(!session.connected);
    assert!(!pulsar.is_connected());
}
