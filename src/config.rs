//! Connection settings for the local link and the two cloud channels.

use crate::error::TuyaError;
use std::str::FromStr;
use std::time::Duration;

/// TCP port every Tuya device listens on for the local protocol.
pub const DEFAULT_LOCAL_PORT: u16 = 6668;
/// Cloud HTTP calls and the Pulsar handshake give up after this long.
pub const DEFAULT_CLOUD_TIMEOUT: Duration = Duration::from_secs(10);
/// Local TCP connects are kept short so sweeps over many devices stay fast.
pub const DEFAULT_LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a `request` waits for the matching reply.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default UDP listening window for discovery.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(6);
/// Keepalive period of the Pulsar WebSocket.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Tuya cloud data center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    China,
    America,
    AmericaEast,
    Europe,
    EuropeWest,
    India,
    /// Explicit base URLs, e.g. for a proxy or a test server
    Custom { openapi: String, pulsar: String },
}

impl Endpoint {
    /// Base URL of the OpenAPI REST service, without trailing slash.
    pub fn openapi_url(&self) -> &str {
        match self {
            Endpoint::China => "https://openapi.tuyacn.com",
            Endpoint::America => "https://openapi.tuyaus.com",
            Endpoint::AmericaEast => "https://openapi-ueaz.tuyaus.com",
            Endpoint::Europe => "https://openapi.tuyaeu.com",
            Endpoint::EuropeWest => "https://openapi-weaz.tuyaeu.com",
            Endpoint::India => "https://openapi.tuyain.com",
            Endpoint::Custom { openapi, .. } => openapi.trim_end_matches('/'),
        }
    }

    /// Base URL of the OpenPulsar WebSocket service, with trailing slash.
    pub fn pulsar_url(&self) -> String {
        match self {
            Endpoint::China => "wss://mqe.tuyacn.com:8285/".to_string(),
            Endpoint::America | Endpoint::AmericaEast => "wss://mqe.tuyaus.com:8285/".to_string(),
            Endpoint::Europe | Endpoint::EuropeWest => "wss://mqe.tuyaeu.com:8285/".to_string(),
            Endpoint::India => "wss://mqe.tuyain.com:8285/".to_string(),
            Endpoint::Custom { pulsar, .. } => {
                if pulsar.ends_with('/') {
                    pulsar.clone()
                } else {
                    format!("{}/", pulsar)
                }
            }
        }
    }
}

impl FromStr for Endpoint {
    type Err = TuyaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cn" | "china" => Ok(Endpoint::China),
            "us" | "america" => Ok(Endpoint::America),
            "us-e" | "america_east" => Ok(Endpoint::AmericaEast),
            "eu" | "europe" => Ok(Endpoint::Europe),
            "eu-w" | "europe_west" => Ok(Endpoint::EuropeWest),
            "in" | "india" => Ok(Endpoint::India),
            other => Err(TuyaError::Config(format!("unknown endpoint '{}'", other))),
        }
    }
}

/// Which Pulsar topic the event stream consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PulsarEnv {
    #[default]
    Prod,
    Test,
}

impl PulsarEnv {
    pub fn topic(&self) -> &'static str {
        match self {
            PulsarEnv::Prod => "event",
            PulsarEnv::Test => "event-test",
        }
    }
}

/// Credentials and tuning shared by the OpenAPI client and the Pulsar stream.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub access_id: String,
    pub access_secret: String,
    pub endpoint: Endpoint,
    pub lang: String,
    /// Suffix of the `dev_channel` header
    pub channel: String,
    pub timeout: Duration,
    pub pulsar_env: PulsarEnv,
    pub ping_interval: Duration,
}

impl CloudConfig {
    pub fn new<I: Into<String>, S: Into<String>>(access_id: I, access_secret: S) -> Self {
        Self {
            access_id: access_id.into(),
            access_secret: access_secret.into(),
            endpoint: Endpoint::Europe,
            lang: "en".to_string(),
            channel: "tuyalink".to_string(),
            timeout: DEFAULT_CLOUD_TIMEOUT,
            pulsar_env: PulsarEnv::Prod,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_lang<S: Into<String>>(mut self, lang: S) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn with_channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pulsar_env(mut self, env: PulsarEnv) -> Self {
        self.pulsar_env = env;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}
