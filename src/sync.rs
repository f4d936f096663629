//! Blocking wrappers for callers without an async runtime.
//!
//! Each call runs the async client on the shared runtime, so signing, the token
//! cache and the token-invalid retry behave exactly as in async code. A
//! [`BlockingOpenApi`] and the [`OpenApi`] it came from share one token.

use crate::cloud::types::{
    DataPointStatus, DeviceChild, DeviceCommand, DeviceDetail, DeviceFactoryInfo,
    DeviceSpecification, DevicesPage,
};
use crate::cloud::{OpenApi, TokenInfo};
use crate::config::CloudConfig;
use crate::error::Result;
use crate::runtime;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Blocking facade over [`OpenApi`].
#[derive(Clone)]
pub struct BlockingOpenApi {
    inner: OpenApi,
}

impl BlockingOpenApi {
    pub fn new(config: CloudConfig) -> Result<Self> {
        Ok(Self {
            inner: OpenApi::new(config)?,
        })
    }

    /// The async client behind this facade.
    pub fn as_async(&self) -> &OpenApi {
        &self.inner
    }

    pub fn connect(&self) -> Result<TokenInfo> {
        runtime::block_on(self.inner.connect())?
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn token(&self) -> Result<TokenInfo> {
        runtime::block_on(self.inner.token())?
    }

    pub fn user_devices(&self, uid: &str) -> Result<Vec<DeviceDetail>> {
        runtime::block_on(self.inner.user_devices(uid))?
    }

    pub fn devices(&self, last_row_key: Option<&str>, size: u32) -> Result<DevicesPage> {
        runtime::block_on(self.inner.devices(last_row_key, size))?
    }

    pub fn all_devices(&self) -> Result<Vec<DeviceDetail>> {
        runtime::block_on(self.inner.all_devices())?
    }

    pub fn device_detail(&self, device_id: &str) -> Result<DeviceDetail> {
        runtime::block_on(self.inner.device_detail(device_id))?
    }

    pub fn device_specification(&self, device_id: &str) -> Result<DeviceSpecification> {
        runtime::block_on(self.inner.device_specification(device_id))?
    }

    pub fn device_status(&self, device_id: &str) -> Result<Vec<DataPointStatus>> {
        runtime::block_on(self.inner.device_status(device_id))?
    }

    pub fn send_command(&self, device_id: &str, commands: &[DeviceCommand]) -> Result<bool> {
        runtime::block_on(self.inner.send_command(device_id, commands))?
    }

    pub fn device_children(&self, device_id: &str) -> Result<Vec<DeviceChild>> {
        runtime::block_on(self.inner.device_children(device_id))?
    }

    pub fn device_factory_infos(&self, device_ids: &[&str]) -> Result<Vec<DeviceFactoryInfo>> {
        runtime::block_on(self.inner.device_factory_infos(device_ids))?
    }

    pub fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<T> {
        runtime::block_on(self.inner.request(method, path, query, body))?
    }
}

impl From<OpenApi> for BlockingOpenApi {
    fn from(inner: OpenApi) -> Self {
        Self { inner }
    }
}

impl OpenApi {
    /// Blocking view sharing this client's token cache.
    pub fn blocking(&self) -> BlockingOpenApi {
        BlockingOpenApi::from(self.clone())
    }
}
