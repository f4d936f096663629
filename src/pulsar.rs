//! OpenPulsar event stream.
//!
//! A WebSocket consumer on the project's Pulsar topic. Messages arrive wrapped
//! three times: outer JSON with a base64 `payload`, which is JSON with a base64
//! `data`, which is AES-128-ECB ciphertext of the actual event. Every message
//! that carries a `messageId` is acknowledged by echoing that id back.

use crate::clock::{self, Clock};
use crate::cloud::types::{DataPointStatus, DataPointValue};
use crate::config::CloudConfig;
use crate::crypto::{TuyaCipher, md5_hex};
use crate::error::{Result, TuyaError};
use base64::{Engine as _, engine::general_purpose};
use futures_core::Stream;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const ACK_TIMEOUT_MILLIS: u32 = 3000;

/// Something that happened on the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PulsarEvent {
    /// Data points reported by a device
    DeviceStatus {
        dev_id: String,
        status: Vec<DataPointStatus>,
    },
    /// Device went online or offline
    DeviceState { dev_id: String, online: bool },
    /// Transport level failure, followed by `Lost`
    Error(String),
    /// Connection dropped without `disconnect()`
    Lost,
    /// `disconnect()` closed the connection
    Disconnected,
}

/// Connection bookkeeping, timestamps in epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSession {
    pub connecting: bool,
    pub connected: bool,
    pub last_connect_attempt: Option<i64>,
    pub disconnected_at: Option<i64>,
    pub lost_at: Option<i64>,
}

struct Connection {
    cancel: CancellationToken,
}

struct PulsarInner {
    config: CloudConfig,
    clock: Arc<dyn Clock>,
    session: Mutex<StreamSession>,
    connection: Mutex<Option<Connection>>,
    events: broadcast::Sender<PulsarEvent>,
}

/// Client for the Tuya OpenPulsar push stream.
#[derive(Clone)]
pub struct OpenPulsar {
    inner: Arc<PulsarInner>,
}

impl OpenPulsar {
    pub fn new(config: CloudConfig) -> Self {
        Self::with_clock(config, clock::system())
    }

    pub fn with_clock(config: CloudConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(PulsarInner {
                config,
                clock,
                session: Mutex::new(StreamSession::default()),
                connection: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn session(&self) -> StreamSession {
        self.inner.session.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().connected
    }

    /// Consumer URL for the configured endpoint and environment.
    pub fn topic_url(&self) -> String {
        let config = &self.inner.config;
        format!(
            "{}ws/v2/consumer/persistent/{}/out/{}/{}-sub?ackTimeoutMillis={}&subscriptionType=Failover",
            config.endpoint.pulsar_url(),
            config.access_id,
            config.pulsar_env.topic(),
            config.access_id,
            ACK_TIMEOUT_MILLIS
        )
    }

    /// Open the WebSocket and start the ping timer. No-op when already connected.
    ///
    /// A `disconnect()` that lands during the handshake wins: the socket is
    /// dropped and `Offline` is returned.
    pub async fn connect(&self) -> Result<()> {
        let cancel = CancellationToken::new();
        {
            let mut session = self.inner.session.lock();
            if session.connected || session.connecting {
                debug!("Pulsar connect skipped, session already active");
                return Ok(());
            }
            session.connecting = true;
            session.last_connect_attempt = Some(self.inner.clock.now_millis());
            *self.inner.connection.lock() = Some(Connection {
                cancel: cancel.clone(),
            });
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TuyaError::Offline),
            result = self.open() => result,
        };

        let mut session = self.inner.session.lock();
        if cancel.is_cancelled() {
            debug!("Pulsar connect abandoned, disconnect requested");
            return Err(TuyaError::Offline);
        }
        session.connecting = false;
        match result {
            Ok(ws) => {
                session.connected = true;
                drop(session);
                self.start(ws, cancel);
                info!("Pulsar stream connected for {}", self.inner.config.access_id);
                Ok(())
            }
            Err(e) => {
                self.inner.connection.lock().take();
                error!("Pulsar connect failed: {}", e);
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<WsStream> {
        let config = &self.inner.config;
        let url = self.topic_url();
        debug!("Connecting to {}", url);

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "username",
            HeaderValue::from_str(&config.access_id)
                .map_err(|e| TuyaError::Encoding(e.to_string()))?,
        );
        headers.insert(
            "password",
            HeaderValue::from_str(&derive_password(&config.access_id, &config.access_secret))
                .map_err(|e| TuyaError::Encoding(e.to_string()))?,
        );

        let (ws, _response) = tokio::time::timeout(config.timeout, connect_async(request))
            .await
            .map_err(|_| TuyaError::Timeout)??;
        Ok(ws)
    }

    fn start(&self, ws: WsStream, cancel: CancellationToken) {
        let (sink, stream) = ws.split();
        let (write_tx, write_rx) = mpsc::channel::<Message>(32);

        tokio::spawn(write_loop(
            sink,
            write_rx,
            self.inner.config.ping_interval,
            cancel.clone(),
        ));

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let reason = read_loop(stream, &inner, write_tx, &cancel).await;
            if cancel.is_cancelled() {
                return;
            }
            // Lost, not requested: tear down our side and tell subscribers.
            cancel.cancel();
            inner.connection.lock().take();
            {
                let mut session = inner.session.lock();
                session.connected = false;
                session.lost_at = Some(inner.clock.now_millis());
            }
            if let Some(reason) = reason {
                let _ = inner.events.send(PulsarEvent::Error(reason));
            }
            warn!("Pulsar stream lost");
            let _ = inner.events.send(PulsarEvent::Lost);
        });
    }

    /// Cancel the ping timer and close the socket. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let connection = self.inner.connection.lock().take();
        let Some(connection) = connection else {
            return;
        };
        connection.cancel.cancel();
        {
            let mut session = self.inner.session.lock();
            session.connecting = false;
            session.connected = false;
            session.disconnected_at = Some(self.inner.clock.now_millis());
        }
        info!("Pulsar stream disconnected");
        let _ = self.inner.events.send(PulsarEvent::Disconnected);
    }

    /// Events from now on. The stream ends when the client is dropped.
    pub fn subscribe(&self) -> impl Stream<Item = PulsarEvent> + Send + 'static {
        let mut rx = self.inner.events.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Pulsar subscriber lagged, {} events skipped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<Message>,
    ping_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = sink.send(msg).await {
                    error!("Pulsar write error: {}", e);
                    break;
                }
            }
            _ = ping.tick() => {
                debug!("Pulsar ping");
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    error!("Pulsar ping failed: {}", e);
                    break;
                }
            }
        }
    }
    debug!("Pulsar write loop stopped");
}

/// Returns the failure reason when the socket errored, `None` on a clean close.
async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    inner: &PulsarInner,
    write_tx: mpsc::Sender<Message>,
    cancel: &CancellationToken,
) -> Option<String> {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return None,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                handle_text(text.as_str(), inner, &write_tx).await;
            }
            Some(Ok(Message::Close(frame))) => {
                debug!("Pulsar closed by server: {:?}", frame);
                return None;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Pulsar read error: {}", e);
                return Some(e.to_string());
            }
            None => return None,
        }
    }
}

async fn handle_text(text: &str, inner: &PulsarInner, write_tx: &mpsc::Sender<Message>) {
    let envelope = match parse_envelope(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Dropping Pulsar message with bad envelope: {}", e);
            return;
        }
    };

    if let Some(id) = &envelope.message_id {
        let ack = json!({ "messageId": id }).to_string();
        if write_tx.send(Message::Text(ack.into())).await.is_err() {
            debug!("Pulsar writer gone, ack for {} not sent", id);
        }
    }

    match decode_payload(&envelope.payload, &inner.config.access_secret) {
        Ok(Some(event)) => {
            debug!("Pulsar event: {:?}", event);
            let _ = inner.events.send(event);
        }
        Ok(None) => {}
        Err(e) => warn!("Dropping undecodable Pulsar message: {}", e),
    }
}

/// `md5hex(access_id + md5hex(access_secret))[8..24]`
pub fn derive_password(access_id: &str, access_secret: &str) -> String {
    let digest = md5_hex(format!("{}{}", access_id, md5_hex(access_secret.as_bytes())).as_bytes());
    digest[8..24].to_string()
}

/// Outer layer of a Pulsar message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PulsarEnvelope {
    #[serde(rename = "messageId", default)]
    pub message_id: Option<String>,
    pub payload: String,
}

pub fn parse_envelope(text: &str) -> Result<PulsarEnvelope> {
    Ok(serde_json::from_str(text)?)
}

/// Decode the base64 `payload` down to an event. `Ok(None)` for event kinds
/// this client does not surface.
pub fn decode_payload(payload: &str, access_secret: &str) -> Result<Option<PulsarEvent>> {
    let middle = general_purpose::STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| TuyaError::Encoding(format!("payload base64: {}", e)))?;
    let middle: Value = serde_json::from_slice(&middle)?;
    let data = middle
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| TuyaError::Json("payload without data".to_string()))?;

    let key = access_secret
        .get(8..24)
        .ok_or_else(|| TuyaError::Encoding("access secret shorter than 24 bytes".to_string()))?;
    let plain = TuyaCipher::new(key.as_bytes())?.decrypt(data.as_bytes(), true)?;
    let event: Value = serde_json::from_slice(&plain)?;
    classify(&event)
}

/// Convenience for tests and tools: all three layers from raw message text.
pub fn decode_message(text: &str, access_secret: &str) -> Result<Option<PulsarEvent>> {
    decode_payload(&parse_envelope(text)?.payload, access_secret)
}

fn classify(event: &Value) -> Result<Option<PulsarEvent>> {
    let dev_id = event.get("devId").and_then(Value::as_str);

    if let Some(biz) = event.get("bizCode").and_then(Value::as_str) {
        let online = match biz {
            "online" => true,
            "offline" => false,
            other => {
                debug!("Ignoring Pulsar bizCode {}", other);
                return Ok(None);
            }
        };
        let dev_id = dev_id
            .or_else(|| event.pointer("/bizData/devId").and_then(Value::as_str))
            .ok_or_else(|| TuyaError::Json("state event without devId".to_string()))?;
        return Ok(Some(PulsarEvent::DeviceState {
            dev_id: dev_id.to_string(),
            online,
        }));
    }

    if let (Some(dev_id), Some(entries)) = (dev_id, event.get("status").and_then(Value::as_array))
    {
        let status = entries
            .iter()
            .map(status_entry)
            .collect::<Result<Vec<_>>>()?;
        return Ok(Some(PulsarEvent::DeviceStatus {
            dev_id: dev_id.to_string(),
            status,
        }));
    }

    debug!("Ignoring Pulsar event without status or bizCode");
    Ok(None)
}

// Entries look like {"code": "switch_1", "value": true, "t": 1700000000000, "1": true};
// the numeric key is the local DP index.
fn status_entry(entry: &Value) -> Result<DataPointStatus> {
    let code = entry
        .get("code")
        .and_then(Value::as_str)
        .ok_or_else(|| TuyaError::Json("status entry without code".to_string()))?;
    let value: Option<DataPointValue> =
        serde_json::from_value(entry.get("value").cloned().unwrap_or(Value::Null))?;
    let dps = entry.as_object().and_then(|obj| {
        obj.keys()
            .find(|k| !k.is_empty() && k.bytes().all(|b| b.is_ascii_digit()))
            .cloned()
    });
    Ok(DataPointStatus {
        code: code.to_string(),
        value,
        dps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdefghijklmnopqrstuv";

    fn wrap(event: &Value, message_id: Option<&str>) -> String {
        let cipher = TuyaCipher::new(&SECRET.as_bytes()[8..24]).unwrap();
        let data = cipher
            .encrypt(event.to_string().as_bytes(), true, true)
            .unwrap();
        let middle = json!({
            "data": String::from_utf8(data).unwrap(),
            "protocol": 4,
            "pv": "2.0",
            "t": 1700000000000i64
        });
        let payload = general_purpose::STANDARD.encode(middle.to_string());
        let mut outer = json!({ "payload": payload, "properties": {} });
        if let Some(id) = message_id {
            outer["messageId"] = json!(id);
        }
        outer.to_string()
    }

    #[test]
    fn test_password_derivation() {
        let expected = md5_hex(format!("akid{}", md5_hex(b"sk")).as_bytes())[8..24].to_string();
        assert_eq!(derive_password("akid", "sk"), expected);
        assert_eq!(derive_password("akid", "sk").len(), 16);
    }

    #[test]
    fn test_status_event() {
        let text = wrap(
            &json!({
                "devId": "dev1",
                "productKey": "pk",
                "status": [
                    {"code": "switch_1", "value": true, "t": 1, "1": true},
                    {"code": "cur_power", "value": 120, "t": 1, "19": 120}
                ]
            }),
            Some("m-1"),
        );
        assert_eq!(parse_envelope(&text).unwrap().message_id.as_deref(), Some("m-1"));
        let event = decode_message(&text, SECRET).unwrap().unwrap();
        match event {
            PulsarEvent::DeviceStatus { dev_id, status } => {
                assert_eq!(dev_id, "dev1");
                assert_eq!(status.len(), 2);
                assert_eq!(status[0].value, Some(DataPointValue::Bool(true)));
                assert_eq!(status[0].dps.as_deref(), Some("1"));
                assert_eq!(status[1].value, Some(DataPointValue::Integer(120)));
                assert_eq!(status[1].dps.as_deref(), Some("19"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_online_offline_events() {
        for (biz, online) in [("online", true), ("offline", false)] {
            let text = wrap(
                &json!({"bizCode": biz, "bizData": {"time": 1}, "devId": "dev2"}),
                None,
            );
            assert_eq!(
                decode_message(&text, SECRET).unwrap(),
                Some(PulsarEvent::DeviceState {
                    dev_id: "dev2".into(),
                    online
                })
            );
        }
        let ignored = wrap(&json!({"bizCode": "nameUpdate", "devId": "dev2"}), None);
        assert_eq!(decode_message(&ignored, SECRET).unwrap(), None);
    }

    #[test]
    fn test_corrupted_layers_are_errors() {
        // Inner ciphertext flipped: decrypt or JSON fails.
        let text = wrap(&json!({"devId": "d", "status": []}), None);
        let envelope = parse_envelope(&text).unwrap();
        let middle: Value =
            serde_json::from_slice(&general_purpose::STANDARD.decode(&envelope.payload).unwrap())
                .unwrap();
        let mut data = general_purpose::STANDARD
            .decode(middle["data"].as_str().unwrap())
            .unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        let broken_middle = json!({"data": general_purpose::STANDARD.encode(&data)});
        let broken_payload = general_purpose::STANDARD.encode(broken_middle.to_string());
        assert!(decode_payload(&broken_payload, SECRET).is_err());

        assert!(parse_envelope("not json").is_err());
        assert!(decode_payload("!!!", SECRET).is_err());
        assert!(decode_payload(&general_purpose::STANDARD.encode("{}"), SECRET).is_err());
        assert!(decode_payload(&envelope.payload, "short").is_err());
    }

    #[test]
    fn test_compound_status_value_rejected() {
        let text = wrap(
            &json!({"devId": "d", "status": [{"code": "c", "value": [1, 2]}]}),
            None,
        );
        assert!(decode_message(&text, SECRET).is_err());
    }

    #[test]
    fn test_topic_url() {
        let config = CloudConfig::new("akid", SECRET).with_endpoint(crate::config::Endpoint::China);
        let pulsar = OpenPulsar::new(config);
        assert_eq!(
            pulsar.topic_url(),
            "wss://mqe.tuyacn.com:8285/ws/v2/consumer/persistent/akid/out/event/akid-sub?ackTimeoutMillis=3000&subscriptionType=Failover"
        );
        assert!(!pulsar.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_noop() {
        let pulsar = OpenPulsar::new(CloudConfig::new("akid", SECRET));
        pulsar.disconnect().await;
        pulsar.disconnect().await;
        assert_eq!(pulsar.session(), StreamSession::default());
    }
}
