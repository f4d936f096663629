//! # tuyalink
//!
//! Transport layer for Tuya devices over three independent channels:
//! the local binary protocol (v3.1/v3.3) on TCP port 6668, the signed
//! OpenAPI REST service, and the OpenPulsar WebSocket event stream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuyalink::{CommandType, Device, Version};
//!
//! # async fn run() -> tuyalink::error::Result<()> {
//! let device = Device::builder("DEVICE_ID", "192.168.1.40", "DEVICE_LOCAL_KEY")
//!     .version(Version::V3_3)
//!     .build()?;
//! device.connect().await?;
//! let reply = device.request(1, CommandType::DpQuery, None).await?;
//! println!("{:?}", reply.payload_json());
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod clock;
pub mod cloud;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod protocol;
pub mod pulsar;
pub mod runtime;
pub mod scanner;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cloud::{OpenApi, TokenInfo};
pub use config::{CloudConfig, Endpoint, PulsarEnv};
pub use device::{Device, DeviceBuilder, DeviceConfig, LinkEvent, LinkState};
pub use error::{DecodeError, TuyaError};
pub use protocol::{CommandType, Frame, LocalCodec, Version};
pub use pulsar::{OpenPulsar, PulsarEvent, StreamSession};
pub use scanner::{DiscoveryResult, Scanner};
pub use sync::BlockingOpenApi;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
