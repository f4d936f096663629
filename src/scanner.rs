//! UDP-based device discovery.
//! Tuya devices announce themselves every few seconds: v3.1 firmware in
//! plaintext on port 6666, v3.3 firmware AES-encrypted on port 6667.

use crate::config::DEFAULT_DISCOVERY_TIMEOUT;
use crate::error::Result;
use crate::protocol::{LocalCodec, Version};
use log::{debug, error, info, warn};
use serde_json::Value;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Port of plaintext (v3.1) announcements.
pub const UDP_PORT_PLAIN: u16 = 6666;
/// Port of encrypted (v3.3) announcements.
pub const UDP_PORT_ENCRYPTED: u16 = 6667;

/// md5("yGAdlopoPVldABfn"), shared by every device for broadcast encryption.
const UDP_KEY: [u8; 16] = [
    0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64, 0x9b, 0x41, 0x0a,
];

/// Information about a discovered Tuya device.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryResult {
    /// Device ID
    pub id: String,
    /// Device IP address
    pub ip: String,
    /// Protocol version, from the announcement or the port it arrived on
    pub version: Option<Version>,
    /// Product Key
    pub product_key: Option<String>,
}

/// Listens for device announcements.
pub struct Scanner {
    /// How long a scan listens
    pub timeout: Duration,
    /// Local address to bind to
    pub bind_addr: String,
    /// UDP ports to listen on (default: 6666, 6667)
    pub ports: Vec<u16>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
            bind_addr: "0.0.0.0".to_string(),
            ports: vec![UDP_PORT_PLAIN, UDP_PORT_ENCRYPTED],
        }
    }

    /// Set discovery timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set ports to listen on.
    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_bind_addr<S: Into<String>>(mut self, addr: S) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Listen for the whole timeout and return every device heard, one entry per ID.
    pub async fn scan(&self) -> Result<Vec<DiscoveryResult>> {
        info!(
            "Starting Tuya device scan (addr: {}, ports: {:?})...",
            self.bind_addr, self.ports
        );
        let mut found = HashMap::new();
        self.listen(|res| {
            found.insert(res.id.clone(), res);
            false
        })
        .await?;
        info!("Scan finished. Found {} devices.", found.len());
        Ok(found.into_values().collect())
    }

    /// Listen until `device_id` announces itself or the timeout passes.
    pub async fn discover_device(&self, device_id: &str) -> Result<Option<DiscoveryResult>> {
        let mut result = None;
        self.listen(|res| {
            if res.id == device_id {
                info!("Found device {} at {}", res.id, res.ip);
                result = Some(res);
                true
            } else {
                false
            }
        })
        .await?;
        if result.is_none() {
            debug!("Device ID {} not found within timeout.", device_id);
        }
        Ok(result)
    }

    /// Feed every decoded announcement to `on_result` until it returns true or time runs out.
    async fn listen<F>(&self, mut on_result: F) -> Result<()>
    where
        F: FnMut(DiscoveryResult) -> bool,
    {
        let mut sockets = Vec::new();
        for &port in &self.ports {
            match self.create_socket(port) {
                Ok(s) => sockets.push((port, s)),
                Err(e) => warn!("Failed to listen on port {}: {}", port, e),
            }
        }
        if sockets.is_empty() {
            return Err(std::io::Error::other("No available ports for scanning").into());
        }

        let (tx, mut rx) = mpsc::channel::<(u16, Vec<u8>, SocketAddr)>(100);
        let cancel = CancellationToken::new();

        for (port, socket) in sockets {
            let tx = tx.clone();
            let ct = cancel.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    tokio::select! {
                        _ = ct.cancelled() => break,
                        res = socket.recv_from(&mut buf) => {
                            match res {
                                Ok((len, addr)) => {
                                    if tx.send((port, buf[..len].to_vec(), addr)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    debug!("UDP receive on port {} failed: {}", port, e);
                                    break;
                                }
                            }
                        }
                    }
                }
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.timeout;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                msg = rx.recv() => {
                    let Some((port, data, addr)) = msg else { break };
                    debug!("Received UDP packet from {}: {} bytes", addr, data.len());
                    if let Some(res) = self.parse_packet(port, &data)
                        && on_result(res)
                    {
                        break;
                    }
                }
            }
        }
        cancel.cancel();
        Ok(())
    }

    /// Create and configure a UDP socket for a given port.
    fn create_socket(&self, port: u16) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:{}", self.bind_addr, port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        debug!("Creating UDP socket for port {}...", port);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set reuse_address on port {}: {}", port, e);
        }
        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to set broadcast on port {}: {}", port, e);
        }

        match socket.bind(&SockAddr::from(addr)) {
            Ok(_) => debug!("Successfully bound to {}", addr),
            Err(e) => {
                error!("Failed to bind to {}: {}", addr, e);
                return Err(e.into());
            }
        }

        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Decode one announcement received on `port`.
    pub fn parse_packet(&self, port: u16, data: &[u8]) -> Option<DiscoveryResult> {
        // Plaintext bodies fall through the v3.3 decrypt, so one codec covers both ports.
        let codec = LocalCodec::new(Version::V3_3, &UDP_KEY).ok()?;
        let json = match codec.decode_frame(data) {
            Ok(frame) => serde_json::from_slice::<Value>(&frame.payload).ok(),
            Err(e) => {
                debug!("Announcement on port {} is not a frame: {}", port, e);
                None
            }
        }
        // Some firmwares skip the framing entirely.
        .or_else(|| serde_json::from_slice::<Value>(data).ok())?;

        let port_version = match port {
            UDP_PORT_PLAIN => Some(Version::V3_1),
            UDP_PORT_ENCRYPTED => Some(Version::V3_3),
            _ => None,
        };
        parse_json(&json, port_version)
    }
}

/// Extract device info from an announcement body.
fn parse_json(val: &Value, port_version: Option<Version>) -> Option<DiscoveryResult> {
    let id = val
        .get("gwId")
        .or_else(|| val.get("devId"))
        .and_then(Value::as_str)?;
    let ip = val.get("ip").and_then(Value::as_str)?;

    let version = val
        .get("version")
        .and_then(Value::as_str)
        .and_then(|s| Version::from_str(s).ok())
        .or(port_version);
    let product_key = val
        .get("productKey")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(DiscoveryResult {
        id: id.to_string(),
        ip: ip.to_string(),
        version,
        product_key,
    })
}
