//! Error types and result definitions for the tuyalink crate.
//! Covers the local link, the OpenAPI client and the OpenPulsar stream.

use thiserror::Error;

/// Why a local frame could not be decoded.
///
/// Decode errors are reported to the caller for logging; they never end a link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the fixed header + suffix
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    /// The buffer does not start with 0x000055AA
    #[error("invalid prefix 0x{0:08X}")]
    InvalidPrefix(u32),

    /// The frame does not end with 0x0000AA55
    #[error("invalid suffix 0x{0:08X}")]
    InvalidSuffix(u32),

    /// The header length disagrees with the bytes available
    #[error("length mismatch: header says {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// CRC32 over the frame does not match the trailing field
    #[error("CRC mismatch: computed 0x{computed:08X}, received 0x{received:08X}")]
    CrcMismatch { computed: u32, received: u32 },

    /// Command code not known to the local protocol
    #[error("unknown command 0x{0:02X}")]
    UnknownCommand(u32),

    /// Body could not be decrypted with the local key
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// Body decrypted but its layout is not what the version expects
    #[error("malformed payload: {0}")]
    Payload(String),
}

/// Represents all possible errors raised by the local link, the cloud client and the event stream.
#[derive(Error, Debug, Clone)]
pub enum TuyaError {
    /// Standard IO error (network, socket setup, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// A local frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Failed to decrypt data (wrong key or version)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt data for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Signing input could not be encoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Request timed out
    #[error("Timeout waiting for device")]
    Timeout,

    /// TCP connection could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// Link is not connected
    #[error("Device offline")]
    Offline,

    /// Version string or number is not 3.1 or 3.3
    #[error("Unsupported protocol version '{0}'")]
    UnsupportedVersion(String),

    /// Cloud call failed before a business answer was received
    /// (connection error, HTTP status, malformed body)
    #[error("Cloud API call failed: {0}")]
    CloudApiCall(String),

    /// Cloud answered with `success: false`
    #[error("Cloud API error {code}: {message}")]
    CloudApi { code: i64, message: String },

    /// Access token could not be obtained or refreshed
    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    /// WebSocket level failure on the event stream
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Blocking call made where the runtime cannot be blocked
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Configuration value not understood
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl From<reqwest::Error> for TuyaError {
    fn from(err: reqwest::Error) -> Self {
        TuyaError::CloudApiCall(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TuyaError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TuyaError::WebSocket(err.to_string())
    }
}

impl TuyaError {
    pub fn code(&self) -> u32 {
        match self {
            TuyaError::Io(_) => ERR_CONNECT,
            TuyaError::Json(_) => ERR_JSON,
            TuyaError::Decode(DecodeError::CrcMismatch { .. } | DecodeError::Decrypt(_)) => {
                ERR_KEY_OR_VER
            }
            TuyaError::Decode(_) => ERR_PAYLOAD,
            TuyaError::DecryptionFailed => ERR_KEY_OR_VER,
            TuyaError::EncryptionFailed => ERR_KEY_OR_VER,
            TuyaError::Encoding(_) => ERR_PARAMS,
            TuyaError::Timeout => ERR_TIMEOUT,
            TuyaError::ConnectionFailed => ERR_CONNECT,
            TuyaError::Offline => ERR_OFFLINE,
            TuyaError::UnsupportedVersion(_) => ERR_KEY_OR_VER,
            TuyaError::CloudApiCall(_) => ERR_CLOUDRESP,
            TuyaError::CloudApi { .. } => ERR_CLOUD,
            TuyaError::TokenRefresh(_) => ERR_CLOUDTOKEN,
            TuyaError::WebSocket(_) => ERR_CONNECT,
            TuyaError::Runtime(_) => ERR_PARAMS,
            TuyaError::Config(_) => ERR_PARAMS,
        }
    }

    /// Whether a caller may reasonably retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TuyaError::Io(_)
                | TuyaError::Timeout
                | TuyaError::ConnectionFailed
                | TuyaError::Offline
                | TuyaError::CloudApiCall(_)
                | TuyaError::TokenRefresh(_)
                | TuyaError::WebSocket(_)
        )
    }
}

// TinyTuya Error Response Codes
define_error_codes! {
    ERR_SUCCESS = 0 => "Connection Successful",
    ERR_JSON = 900 => "Invalid JSON Response from Device",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_CLOUDKEY = 909 => "Missing Tuya Cloud Key and Secret",
    ERR_CLOUDRESP = 910 => "Invalid JSON Response from Cloud",
    ERR_CLOUDTOKEN = 911 => "Unable to Get Cloud Token",
    ERR_PARAMS = 912 => "Missing Function Parameters",
    ERR_CLOUD = 913 => "Error Response from Tuya Cloud",
    ERR_KEY_OR_VER = 914 => "Check device key or version",
}
