//! Local link to a single Tuya device.
//! One TCP socket per device, frames in and out through [`LocalCodec`].
//! The caller owns sequence numbers and decides when to reconnect.

use crate::clock::{self, Clock};
use crate::config::{DEFAULT_LOCAL_CONNECT_TIMEOUT, DEFAULT_LOCAL_PORT, DEFAULT_RESPONSE_TIMEOUT};
use crate::error::{DecodeError, Result, TuyaError};
use crate::protocol::{CommandType, Frame, LocalCodec, SUFFIX_LEN, Version};
use byteorder::{BigEndian, ByteOrder};
use futures_core::stream::Stream;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

const KEY_GW_ID: &str = "gwId";
const KEY_DEV_ID: &str = "devId";
const KEY_UID: &str = "uid";
const KEY_T: &str = "t";
const KEY_DPS: &str = "dps";

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Static description of one device on the LAN.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub id: String,
    /// 16-byte local key as issued by the cloud
    pub local_key: String,
    /// Host name or IP address
    pub address: String,
    pub version: Version,
    pub port: u16,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

/// Lifecycle of a [`Device`] link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    /// Terminal, reached through [`Device::close`]
    Closed,
}

/// What subscribers see coming off the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Frame(Frame),
    /// A frame that failed to decode; the link stays up
    DecodeError(DecodeError),
    Disconnected,
}

/// Builder for [`Device`].
pub struct DeviceBuilder {
    config: DeviceConfig,
    clock: Arc<dyn Clock>,
}

impl DeviceBuilder {
    pub fn new<I, A, K>(id: I, address: A, local_key: K) -> Self
    where
        I: Into<String>,
        A: Into<String>,
        K: Into<String>,
    {
        Self {
            config: DeviceConfig {
                id: id.into(),
                local_key: local_key.into(),
                address: address.into(),
                version: Version::V3_3,
                port: DEFAULT_LOCAL_PORT,
                connect_timeout: DEFAULT_LOCAL_CONNECT_TIMEOUT,
                response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            },
            clock: clock::system(),
        }
    }

    pub fn version<V: Into<Version>>(mut self, version: V) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fails when the local key is not 16 bytes.
    pub fn build(self) -> Result<Device> {
        Device::with_clock(self.config, self.clock)
    }
}

struct Link {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

struct DeviceInner {
    config: DeviceConfig,
    codec: LocalCodec,
    clock: Arc<dyn Clock>,
    state: Mutex<LinkState>,
    link: Mutex<Option<Link>>,
    /// Waiters by seqno, tagged with the id of the request that registered them
    pending: Mutex<HashMap<u32, (u64, oneshot::Sender<Frame>)>>,
    next_request_id: AtomicU64,
    events: broadcast::Sender<LinkEvent>,
}

/// Handle to a device's local link. Clones share the same socket.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        Self::with_clock(config, clock::system())
    }

    pub fn with_clock(config: DeviceConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let codec = LocalCodec::new(config.version, config.local_key.as_bytes())?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(DeviceInner {
                config,
                codec,
                clock,
                state: Mutex::new(LinkState::Idle),
                link: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(0),
                events,
            }),
        })
    }

    pub fn builder<I, A, K>(id: I, address: A, local_key: K) -> DeviceBuilder
    where
        I: Into<String>,
        A: Into<String>,
        K: Into<String>,
    {
        DeviceBuilder::new(id, address, local_key)
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn version(&self) -> Version {
        self.inner.config.version
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// Open the TCP connection and start the reader task.
    pub async fn connect(&self) -> Result<()> {
        let previous = {
            let mut state = self.inner.state.lock();
            match *state {
                LinkState::Connected | LinkState::Connecting => return Ok(()),
                LinkState::Closed => return Err(TuyaError::Offline),
                prev => {
                    *state = LinkState::Connecting;
                    prev
                }
            }
        };

        let config = &self.inner.config;
        let addr = format!("{}:{}", config.address, config.port);
        debug!("Connecting to device {} at {}", config.id, addr);

        let stream = match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Connection to {} failed: {}", addr, e);
                self.restore_state(previous);
                return Err(TuyaError::ConnectionFailed);
            }
            Err(_) => {
                warn!("Connection to {} timed out", addr);
                self.restore_state(previous);
                return Err(TuyaError::Timeout);
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", addr, e);
        }

        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();
        {
            let mut state = self.inner.state.lock();
            if *state != LinkState::Connecting {
                // closed while we were connecting
                return Err(TuyaError::Offline);
            }
            *self.inner.link.lock() = Some(Link {
                writer: Arc::new(tokio::sync::Mutex::new(write_half)),
                cancel: cancel.clone(),
            });
            *state = LinkState::Connected;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.read_loop(read_half, cancel).await });

        info!("Connected to device {} at {}", config.id, addr);
        Ok(())
    }

    fn restore_state(&self, previous: LinkState) {
        let mut state = self.inner.state.lock();
        if *state == LinkState::Connecting {
            *state = previous;
        }
    }

    /// Close the socket. Safe to call in any state, any number of times.
    pub async fn disconnect(&self) {
        self.inner.teardown(LinkState::Disconnected).await;
    }

    /// Disconnect for good; later `connect` calls fail.
    pub async fn close(&self) {
        info!("Closing device {}", self.inner.config.id);
        self.inner.teardown(LinkState::Closed).await;
    }

    // -------------------------------------------------------------------------
    // Messaging
    // -------------------------------------------------------------------------

    /// Build the command's JSON, encode and write it. Returns the frame as sent.
    pub async fn send(&self, seqno: u32, cmd: CommandType, data: Option<Value>) -> Result<Frame> {
        let writer = self
            .inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.writer.clone())
            .ok_or(TuyaError::Offline)?;

        let payload = serde_json::to_vec(&self.build_payload(cmd, data))?;
        let mut frame = Frame::new(seqno, cmd, payload);
        let packet = self.inner.codec.encode_frame(&frame)?;
        frame.crc = BigEndian::read_u32(&packet[packet.len() - SUFFIX_LEN..]);

        debug!(
            "Sending {} seqno={} to {}",
            cmd, seqno, self.inner.config.id
        );
        let mut writer = writer.lock().await;
        if let Err(e) = writer.write_all(&packet).await {
            error!("Write to {} failed: {}", self.inner.config.id, e);
            return Err(e.into());
        }
        Ok(frame)
    }

    /// Send and wait for the reply carrying the same sequence number.
    pub async fn request(&self, seqno: u32, cmd: CommandType, data: Option<Value>) -> Result<Frame> {
        let (tx, rx) = oneshot::channel();
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.lock().insert(seqno, (request_id, tx));

        if let Err(e) = self.send(seqno, cmd, data).await {
            self.inner.forget_waiter(seqno, request_id);
            return Err(e);
        }

        match timeout(self.inner.config.response_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            // Sender dropped: link went down before the reply.
            Ok(Err(_)) => Err(TuyaError::Offline),
            Err(_) => {
                self.inner.forget_waiter(seqno, request_id);
                warn!(
                    "No reply from {} for {} seqno={}",
                    self.inner.config.id, cmd, seqno
                );
                Err(TuyaError::Timeout)
            }
        }
    }

    /// Frames, decode errors and disconnects from now on.
    pub fn subscribe(&self) -> impl Stream<Item = LinkEvent> + Send + 'static {
        let mut rx = self.inner.events.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Link subscriber lagged, {} events skipped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// JSON body for `cmd`. `data` becomes `dps` for the commands that carry one.
    pub fn build_payload(&self, cmd: CommandType, data: Option<Value>) -> Value {
        let id = self.inner.config.id.as_str();
        let t = (self.inner.clock.now_millis() / 1000).to_string();

        let mut payload = Map::new();
        match cmd {
            CommandType::Control | CommandType::ControlNew => {
                payload.insert(KEY_DEV_ID.into(), id.into());
                payload.insert(KEY_UID.into(), id.into());
                payload.insert(KEY_T.into(), t.into());
                payload.insert(KEY_DPS.into(), data.unwrap_or_else(|| Value::Object(Map::new())));
            }
            CommandType::Status | CommandType::HeartBeat => {
                payload.insert(KEY_GW_ID.into(), id.into());
                payload.insert(KEY_DEV_ID.into(), id.into());
            }
            CommandType::DpQuery => {
                payload.insert(KEY_GW_ID.into(), id.into());
                payload.insert(KEY_DEV_ID.into(), id.into());
                payload.insert(KEY_UID.into(), id.into());
                payload.insert(KEY_T.into(), t.into());
            }
            CommandType::DpQueryNew => {
                payload.insert(KEY_DEV_ID.into(), id.into());
                payload.insert(KEY_UID.into(), id.into());
                payload.insert(KEY_T.into(), t.into());
            }
            _ => return data.unwrap_or_else(|| Value::Object(Map::new())),
        }
        Value::Object(payload)
    }
}

impl DeviceInner {
    async fn read_loop(self: Arc<Self>, read_half: OwnedReadHalf, cancel: CancellationToken) {
        let mut frames = FramedRead::new(read_half, self.codec.clone());
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = frames.next() => item,
            };
            match item {
                Some(Ok(Ok(frame))) => {
                    debug!(
                        "Received {} seqno={} from {} ({} bytes)",
                        frame.cmd,
                        frame.seqno,
                        self.config.id,
                        frame.payload.len()
                    );
                    if let Some((_, waiter)) = self.pending.lock().remove(&frame.seqno) {
                        let _ = waiter.send(frame.clone());
                    }
                    let _ = self.events.send(LinkEvent::Frame(frame));
                }
                Some(Ok(Err(e))) => {
                    warn!("Undecodable frame from {}: {}", self.config.id, e);
                    let _ = self.events.send(LinkEvent::DecodeError(e));
                }
                Some(Err(e)) => {
                    warn!("Read from {} failed: {}", self.config.id, e);
                    break;
                }
                None => {
                    debug!("Device {} closed the connection", self.config.id);
                    break;
                }
            }
        }

        if !cancel.is_cancelled() {
            self.teardown(LinkState::Disconnected).await;
        }
        debug!("Reader task for {} stopped", self.config.id);
    }

    /// Drop the waiter for `seqno` only if a later request has not replaced it.
    fn forget_waiter(&self, seqno: u32, request_id: u64) {
        let mut pending = self.pending.lock();
        if pending.get(&seqno).is_some_and(|(id, _)| *id == request_id) {
            pending.remove(&seqno);
        }
    }

    async fn teardown(&self, next: LinkState) {
        let link = {
            let mut state = self.state.lock();
            let was = *state;
            if was != LinkState::Closed {
                *state = match (was, next) {
                    (LinkState::Idle, LinkState::Disconnected) => LinkState::Idle,
                    _ => next,
                };
            }
            self.link.lock().take()
        };
        // Dropping the senders fails every pending request.
        self.pending.lock().clear();

        if let Some(link) = link {
            link.cancel.cancel();
            let mut writer = link.writer.lock().await;
            let _ = writer.shutdown().await;
            info!("Disconnected from device {}", self.config.id);
            let _ = self.events.send(LinkEvent::Disconnected);
        }
    }
}
