//! Signed OpenAPI client.
//!
//! Every call goes through the same pipeline: make sure a token is available,
//! sign, send, unwrap the `{success, result, code, msg, t}` envelope. A
//! "token invalid" answer drops the token and the call is retried once with a
//! fresh grant.

use crate::clock::{self, Clock};
use crate::cloud::sign::{SIGN_METHOD, SignInput, sign};
use crate::cloud::token::{TokenCache, TokenInfo};
use crate::cloud::types::{
    ApiEnvelope, DataPointStatus, DeviceChild, DeviceCommand, DeviceDetail, DeviceFactoryInfo,
    DeviceSpecification, DevicesPage, TokenResult,
};
use crate::config::CloudConfig;
use crate::error::{Result, TuyaError};
use log::{debug, info, warn};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

/// Business code the cloud returns for an unknown or expired access token.
pub const TOKEN_INVALID: i64 = 1010;

const TOKEN_PATH: &str = "/v1.0/token";
const DEFAULT_PAGE_SIZE: u32 = 20;

struct Inner {
    config: CloudConfig,
    http: Client,
    tokens: TokenCache,
    clock: Arc<dyn Clock>,
}

/// Handle to the Tuya OpenAPI. Cheap to clone; clones share one token.
#[derive(Clone)]
pub struct OpenApi {
    inner: Arc<Inner>,
}

impl OpenApi {
    pub fn new(config: CloudConfig) -> Result<Self> {
        Self::with_clock(config, clock::system())
    }

    pub fn with_clock(config: CloudConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TuyaError::CloudApiCall(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                http,
                tokens: TokenCache::new(clock.clone()),
                clock,
            }),
        })
    }

    pub fn config(&self) -> &CloudConfig {
        &self.inner.config
    }

    /// Discard any cached token and authenticate from scratch.
    pub async fn connect(&self) -> Result<TokenInfo> {
        info!(
            "Connecting to OpenAPI at {}",
            self.inner.config.endpoint.openapi_url()
        );
        self.inner.tokens.reset();
        self.token().await
    }

    /// True while a non-expired token is cached.
    pub fn is_connected(&self) -> bool {
        self.inner.tokens.is_valid()
    }

    /// A valid token, granting or refreshing one when needed.
    pub async fn token(&self) -> Result<TokenInfo> {
        self.ensure_token().await
    }

    /// Exchange the refresh token for a new pair even if the current one is valid.
    pub async fn refresh_token(&self) -> Result<TokenInfo> {
        self.fetch_through_cache(true).await
    }

    pub fn current_token(&self) -> Option<TokenInfo> {
        self.inner.tokens.current()
    }

    pub fn reset_token(&self) {
        self.inner.tokens.reset();
    }

    /// Devices bound to an app user.
    pub async fn user_devices(&self, uid: &str) -> Result<Vec<DeviceDetail>> {
        self.request(
            Method::GET,
            &format!("/v1.0/users/{}/devices", uid),
            &[],
            None,
        )
        .await
    }

    /// One page of the devices of all users linked to the cloud project.
    pub async fn devices(&self, last_row_key: Option<&str>, size: u32) -> Result<DevicesPage> {
        let size = size.to_string();
        let mut query = vec![("size", size.as_str())];
        if let Some(key) = last_row_key {
            query.push(("last_row_key", key));
        }
        self.request(
            Method::GET,
            "/v1.0/iot-01/associated-users/devices",
            &query,
            None,
        )
        .await
    }

    /// Walk every page of [`OpenApi::devices`].
    pub async fn all_devices(&self) -> Result<Vec<DeviceDetail>> {
        let mut devices = Vec::new();
        let mut last_row_key: Option<String> = None;
        loop {
            let page = self
                .devices(last_row_key.as_deref(), DEFAULT_PAGE_SIZE)
                .await?;
            devices.extend(page.list);
            match page.last_row_key {
                Some(key) if page.has_more && last_row_key.as_deref() != Some(key.as_str()) => {
                    last_row_key = Some(key);
                }
                _ => break,
            }
        }
        debug!("Fetched {} devices", devices.len());
        Ok(devices)
    }

    pub async fn device_detail(&self, device_id: &str) -> Result<DeviceDetail> {
        self.request(
            Method::GET,
            &format!("/v1.0/devices/{}", device_id),
            &[],
            None,
        )
        .await
    }

    pub async fn device_specification(&self, device_id: &str) -> Result<DeviceSpecification> {
        self.request(
            Method::GET,
            &format!("/v1.2/iot-03/devices/{}/specification", device_id),
            &[],
            None,
        )
        .await
    }

    pub async fn device_status(&self, device_id: &str) -> Result<Vec<DataPointStatus>> {
        self.request(
            Method::GET,
            &format!("/v1.0/iot-03/devices/{}/status", device_id),
            &[],
            None,
        )
        .await
    }

    /// Issue standard instructions; returns the cloud's acceptance flag.
    pub async fn send_command(&self, device_id: &str, commands: &[DeviceCommand]) -> Result<bool> {
        self.request(
            Method::POST,
            &format!("/v1.0/iot-03/devices/{}/commands", device_id),
            &[],
            Some(json!({ "commands": commands })),
        )
        .await
    }

    /// Sub-devices behind a gateway.
    pub async fn device_children(&self, device_id: &str) -> Result<Vec<DeviceChild>> {
        self.request(
            Method::GET,
            &format!("/v1.0/devices/{}/sub-devices", device_id),
            &[],
            None,
        )
        .await
    }

    pub async fn device_factory_infos(&self, device_ids: &[&str]) -> Result<Vec<DeviceFactoryInfo>> {
        let ids = device_ids.join(",");
        self.request(
            Method::GET,
            "/v1.0/iot-03/devices/factory-infos",
            &[("device_ids", ids.as_str())],
            None,
        )
        .await
    }

    /// Signed call to any OpenAPI path, decoding `result` as `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<T> {
        let query: BTreeMap<String, String> = query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let mut retried = false;
        loop {
            let token = self.ensure_token().await?;
            let envelope = self
                .inner
                .dispatch(
                    method.clone(),
                    path,
                    &query,
                    body.as_ref(),
                    &token.access_token,
                )
                .await?;

            if !envelope.success && envelope.code == Some(TOKEN_INVALID) && !retried {
                warn!("Access token rejected on {} {}, re-authenticating", method, path);
                self.inner.tokens.invalidate(&token);
                retried = true;
                continue;
            }
            return decode_result(envelope);
        }
    }

    async fn ensure_token(&self) -> Result<TokenInfo> {
        self.fetch_through_cache(false).await
    }

    async fn fetch_through_cache(&self, forced: bool) -> Result<TokenInfo> {
        let inner = self.inner.clone();
        self.inner
            .tokens
            .get_or_refresh(forced, move |previous| async move {
                inner.fetch_token(previous).await
            })
            .await
    }
}

impl Inner {
    /// Refresh with the previous token when there is one, else grant.
    ///
    /// Projects that do not allow the refresh endpoint answer it with a business
    /// error; those fall back to a full grant.
    async fn fetch_token(&self, previous: Option<TokenInfo>) -> Result<TokenInfo> {
        if let Some(previous) = previous {
            let path = format!("{}/{}", TOKEN_PATH, previous.refresh_token);
            match self.request_token(&path, BTreeMap::new()).await {
                Ok(token) => return Ok(token),
                Err(TuyaError::CloudApi { code, message }) => {
                    warn!(
                        "Token refresh refused ({}: {}), requesting a new grant",
                        code, message
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let mut query = BTreeMap::new();
        query.insert("grant_type".to_string(), "1".to_string());
        self.request_token(TOKEN_PATH, query).await
    }

    async fn request_token(
        &self,
        path: &str,
        query: BTreeMap<String, String>,
    ) -> Result<TokenInfo> {
        let envelope = self.dispatch(Method::GET, path, &query, None, "").await?;
        let server_t = if envelope.t > 0 {
            envelope.t
        } else {
            self.clock.now_millis()
        };
        let result: TokenResult = decode_result(envelope)?;
        let token = TokenInfo::from_grant(result, server_t);
        info!("Obtained access token for uid {}", token.uid);
        Ok(token)
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        query: &BTreeMap<String, String>,
        body: Option<&Value>,
        access_token: &str,
    ) -> Result<ApiEnvelope> {
        let body = body.map(serde_json::to_vec).transpose()?;
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let signed = sign(&SignInput {
            access_id: &self.config.access_id,
            secret: &self.config.access_secret,
            access_token,
            method: method.as_str(),
            path,
            query,
            body: body.as_deref(),
            nonce: &nonce,
            timestamp_ms: self.clock.now_millis(),
        })?;

        let mut url = Url::parse(&format!("{}{}", self.config.endpoint.openapi_url(), path))
            .map_err(|e| TuyaError::CloudApiCall(format!("invalid URL for {}: {}", path, e)))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }

        let timestamp = signed.timestamp_ms.to_string();
        let channel = format!("cloud_{}", self.config.channel);
        let mut headers = HeaderMap::new();
        for (name, value) in [
            ("client_id", self.config.access_id.as_str()),
            ("sign", signed.sign.as_str()),
            ("sign_method", SIGN_METHOD),
            ("access_token", access_token),
            ("t", timestamp.as_str()),
            ("nonce", signed.nonce.as_str()),
            ("lang", self.config.lang.as_str()),
            ("dev_lang", "rust"),
            ("dev_version", env!("CARGO_PKG_VERSION")),
            ("dev_channel", channel.as_str()),
            ("Signature-Headers", "client_id"),
        ] {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| TuyaError::Encoding(format!("header {}: {}", name, e)))?,
                HeaderValue::from_str(value)
                    .map_err(|e| TuyaError::Encoding(format!("header {}: {}", name, e)))?,
            );
        }

        debug!("OpenAPI {} {}", method, path);
        let mut request = self.http.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(TuyaError::CloudApiCall(format!(
                "HTTP {}: {}",
                status,
                String::from_utf8_lossy(&bytes)
            )));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| TuyaError::CloudApiCall(format!("malformed response: {}", e)))
    }
}

fn decode_result<T: DeserializeOwned>(envelope: ApiEnvelope) -> Result<T> {
    if !envelope.success {
        return Err(TuyaError::CloudApi {
            code: envelope.code.unwrap_or(-1),
            message: envelope.msg.unwrap_or_default(),
        });
    }
    serde_json::from_value(envelope.result.unwrap_or(Value::Null))
        .map_err(|e| TuyaError::CloudApiCall(format!("unexpected result shape: {}", e)))
}
