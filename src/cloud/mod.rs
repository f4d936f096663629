//! Tuya OpenAPI: request signing, token lifecycle and the REST client.

pub mod api;
pub mod sign;
pub mod token;
pub mod types;

pub use api::{OpenApi, TOKEN_INVALID};
pub use sign::{SignInput, SignedRequest, sign};
pub use token::{TokenCache, TokenInfo};
pub use types::{
    DataPointStatus, DataPointValue, DeviceChild, DeviceCommand, DeviceDetail, DeviceFactoryInfo,
    DeviceFunction, DeviceSpecification, DevicesPage,
};
