//! OpenAPI client against a local axum stand-in for the Tuya cloud.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tuyalink::cloud::sign::{SignInput, sign};
use tuyalink::cloud::types::DataPointValue;
use tuyalink::cloud::{DeviceCommand, OpenApi};
use tuyalink::{CloudConfig, Endpoint, ManualClock, TuyaError};

const ACCESS_ID: &str = "akid0123";
const SECRET: &str = "secret0123456789abcdefgh";

#[derive(Default)]
struct FakeCloud {
    grants: AtomicUsize,
    refreshes: AtomicUsize,
    status_calls: AtomicUsize,
    refresh_allowed: AtomicBool,
    grant_fails: AtomicBool,
    always_reject: AtomicBool,
    status_http_error: AtomicBool,
    grant_delay_ms: AtomicU64,
    server_t: AtomicI64,
    rejected_tokens: Mutex<HashSet<String>>,
    last_status: Mutex<Option<(HeaderMap, String)>>,
    last_command: Mutex<Option<Value>>,
}

impl FakeCloud {
    fn t(&self) -> i64 {
        self.server_t.load(Ordering::SeqCst)
    }

    fn token_answer(&self, prefix: &str, n: usize) -> Json<Value> {
        Json(json!({
            "success": true,
            "t": self.t(),
            "result": {
                "access_token": format!("{prefix}-{n}"),
                "refresh_token": format!("ref-{prefix}-{n}"),
                "uid": "uid-1",
                "expire_time": 7200
            }
        }))
    }
}

type Shared = Arc<FakeCloud>;

async fn grant(
    State(fake): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let n = fake.grants.fetch_add(1, Ordering::SeqCst) + 1;
    assert_eq!(query.get("grant_type").map(String::as_str), Some("1"));
    let delay = fake.grant_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if fake.grant_fails.load(Ordering::SeqCst) {
        return Json(json!({"success": false, "code": 1010, "msg": "token invalid", "t": fake.t()}));
    }
    fake.token_answer("tok", n)
}

async fn refresh(State(fake): State<Shared>, Path(refresh_token): Path<String>) -> Json<Value> {
    let n = fake.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
    assert!(refresh_token.starts_with("ref-"));
    if !fake.refresh_allowed.load(Ordering::SeqCst) {
        return Json(json!({"success": false, "code": 1100, "msg": "refresh not allowed", "t": fake.t()}));
    }
    fake.token_answer("refreshed", n)
}

async fn status(
    State(fake): State<Shared>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> (StatusCode, Json<Value>) {
    fake.status_calls.fetch_add(1, Ordering::SeqCst);
    *fake.last_status.lock().unwrap() = Some((headers.clone(), uri.path().to_string()));

    if fake.status_http_error.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"oops": true})));
    }
    let token = headers
        .get("access_token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if fake.always_reject.load(Ordering::SeqCst)
        || fake.rejected_tokens.lock().unwrap().contains(&token)
    {
        return (
            StatusCode::OK,
            Json(json!({"success": false, "code": 1010, "msg": "token invalid", "t": fake.t()})),
        );
    }
    if device_id == "missing" {
        return (
            StatusCode::OK,
            Json(json!({"success": false, "code": 2009, "msg": "device not exist", "t": fake.t()})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "t": fake.t(),
            "result": [
                {"code": "switch_1", "value": true},
                {"code": "countdown_1", "value": 0}
            ]
        })),
    )
}

async fn commands(
    State(fake): State<Shared>,
    Path(_device_id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    *fake.last_command.lock().unwrap() = Some(body);
    Json(json!({"success": true, "result": true, "t": fake.t()}))
}

async fn associated_devices(
    State(fake): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let page = match query.get("last_row_key").map(String::as_str) {
        None => json!({
            "devices": [{"id": "d1", "name": "Lamp"}, {"id": "d2", "name": "Plug"}],
            "has_more": true,
            "last_row_key": "k1",
            "total": 3
        }),
        Some("k1") => json!({
            "devices": [{"id": "d3", "name": "Fan", "online": true}],
            "has_more": false,
            "last_row_key": "k2",
            "total": 3
        }),
        Some(other) => panic!("unexpected last_row_key {other}"),
    };
    Json(json!({"success": true, "result": page, "t": fake.t()}))
}

async fn start(fake: Shared) -> SocketAddr {
    let app = Router::new()
        .route("/v1.0/token", get(grant))
        .route("/v1.0/token/{refresh_token}", get(refresh))
        .route("/v1.0/iot-03/devices/{device_id}/status", get(status))
        .route("/v1.0/iot-03/devices/{device_id}/commands", post(commands))
        .route("/v1.0/iot-01/associated-users/devices", get(associated_devices))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn config(addr: SocketAddr) -> CloudConfig {
    CloudConfig::new(ACCESS_ID, SECRET).with_endpoint(Endpoint::Custom {
        openapi: format!("http://{}", addr),
        pulsar: "ws://127.0.0.1:1".into(),
    })
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

#[tokio::test]
async fn test_grant_then_signed_status_call() {
    let fake = Arc::new(FakeCloud::default());
    fake.server_t.store(1_700_000_000_000, Ordering::SeqCst);
    let addr = start(fake.clone()).await;
    let api = OpenApi::new(config(addr)).unwrap();

    let token = api.connect().await.unwrap();
    assert_eq!(token.access_token, "tok-1");
    assert_eq!(token.uid, "uid-1");
    assert_eq!(token.expire_at_ms, 1_700_000_000_000 + 7_200_000);

    let status = api.device_status("d1").await.unwrap();
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].value, Some(DataPointValue::Bool(true)));
    assert_eq!(fake.grants.load(Ordering::SeqCst), 1);

    let (headers, path) = fake.last_status.lock().unwrap().clone().unwrap();
    assert_eq!(header(&headers, "client_id"), ACCESS_ID);
    assert_eq!(header(&headers, "sign_method"), "HMAC-SHA256");
    assert_eq!(header(&headers, "access_token"), "tok-1");
    assert_eq!(header(&headers, "lang"), "en");
    assert_eq!(header(&headers, "dev_lang"), "rust");
    assert_eq!(header(&headers, "dev_channel"), "cloud_tuyalink");
    assert_eq!(header(&headers, "signature-headers"), "client_id");
    assert!(!header(&headers, "dev_version").is_empty());

    let query = BTreeMap::new();
    let expected = sign(&SignInput {
        access_id: ACCESS_ID,
        secret: SECRET,
        access_token: "tok-1",
        method: "GET",
        path: &path,
        query: &query,
        body: None,
        nonce: header(&headers, "nonce"),
        timestamp_ms: header(&headers, "t").parse().unwrap(),
    })
    .unwrap();
    assert_eq!(header(&headers, "sign"), expected.sign);
}

#[tokio::test]
async fn test_concurrent_calls_share_one_grant() {
    let fake = Arc::new(FakeCloud::default());
    fake.grant_delay_ms.store(150, Ordering::SeqCst);
    let addr = start(fake.clone()).await;
    let api = OpenApi::new(config(addr)).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let api = api.clone();
        handles.push(tokio::spawn(async move { api.device_status("d1").await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(fake.grants.load(Ordering::SeqCst), 1);
    assert_eq!(fake.status_calls.load(Ordering::SeqCst), 8);
    assert!(api.is_connected());
}

#[tokio::test]
async fn test_token_invalid_triggers_single_retry() {
    let fake = Arc::new(FakeCloud::default());
    fake.rejected_tokens.lock().unwrap().insert("tok-1".into());
    let addr = start(fake.clone()).await;
    let api = OpenApi::new(config(addr)).unwrap();

    api.device_status("d1").await.unwrap();
    assert_eq!(fake.grants.load(Ordering::SeqCst), 2);
    assert_eq!(fake.status_calls.load(Ordering::SeqCst), 2);
    assert_eq!(api.current_token().unwrap().access_token, "tok-2");
}

#[tokio::test]
async fn test_persistent_token_invalid_fails_after_one_retry() {
    let fake = Arc::new(FakeCloud::default());
    fake.always_reject.store(true, Ordering::SeqCst);
    let addr = start(fake.clone()).await;
    let api = OpenApi::new(config(addr)).unwrap();

    let err = api.device_status("d1").await.unwrap_err();
    assert!(matches!(err, TuyaError::CloudApi { code: 1010, .. }));
    assert_eq!(fake.status_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_token_endpoint_failure_is_not_retried() {
    let fake = Arc::new(FakeCloud::default());
    fake.grant_fails.store(true, Ordering::SeqCst);
    let addr = start(fake.clone()).await;
    let api = OpenApi::new(config(addr)).unwrap();

    let err = api.connect().await.unwrap_err();
    assert!(matches!(err, TuyaError::TokenRefresh(ref m) if m.contains("1010")));
    assert_eq!(fake.grants.load(Ordering::SeqCst), 1);
    assert!(!api.is_connected());

    // The cache is back to absent: the next call tries again.
    fake.grant_fails.store(false, Ordering::SeqCst);
    api.device_status("d1").await.unwrap();
    assert_eq!(fake.grants.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_expired_token_refresh_and_fallback() {
    let fake = Arc::new(FakeCloud::default());
    fake.server_t.store(1_000_000, Ordering::SeqCst);
    let addr = start(fake.clone()).await;
    let clock = ManualClock::new(1_000_000);
    let api = OpenApi::with_clock(config(addr), clock.clone()).unwrap();

    api.connect().await.unwrap();
    assert_eq!(fake.grants.load(Ordering::SeqCst), 1);

    // Refresh endpoint refused: fall back to a grant.
    clock.set(1_000_000 + 7_200_000 - 60_000 + 1);
    assert!(!api.is_connected());
    api.device_status("d1").await.unwrap();
    assert_eq!(fake.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(fake.grants.load(Ordering::SeqCst), 2);

    // Refresh endpoint allowed: no extra grant.
    fake.refresh_allowed.store(true, Ordering::SeqCst);
    fake.server_t.store(20_000_000, Ordering::SeqCst);
    clock.set(1_000_000 + 7_200_000 + 1);
    api.device_status("d1").await.unwrap();
    assert_eq!(fake.refreshes.load(Ordering::SeqCst), 2);
    assert_eq!(fake.grants.load(Ordering::SeqCst), 2);
    let token = api.current_token().unwrap();
    assert_eq!(token.access_token, "refreshed-2");
    assert_eq!(token.expire_at_ms, 20_000_000 + 7_200_000);
}

#[tokio::test]
async fn test_business_and_transport_errors() {
    let fake = Arc::new(FakeCloud::default());
    let addr = start(fake.clone()).await;
    let api = OpenApi::new(config(addr)).unwrap();

    let err = api.device_status("missing").await.unwrap_err();
    assert!(
        matches!(err, TuyaError::CloudApi { code: 2009, ref message } if message == "device not exist")
    );

    fake.status_http_error.store(true, Ordering::SeqCst);
    let err = api.device_status("d1").await.unwrap_err();
    assert!(matches!(err, TuyaError::CloudApiCall(ref m) if m.contains("500")));

    let err = api.device_detail("d1").await.unwrap_err();
    assert!(matches!(err, TuyaError::CloudApiCall(_)));
}

#[tokio::test]
async fn test_commands_and_paging() {
    let fake = Arc::new(FakeCloud::default());
    let addr = start(fake.clone()).await;
    let api = OpenApi::new(config(addr)).unwrap();

    let accepted = api
        .send_command(
            "d1",
            &[
                DeviceCommand::new("switch_1", true),
                DeviceCommand::new("countdown_1", 30),
            ],
        )
        .await
        .unwrap();
    assert!(accepted);
    assert_eq!(
        fake.last_command.lock().unwrap().clone().unwrap(),
        json!({"commands": [
            {"code": "switch_1", "value": true},
            {"code": "countdown_1", "value": 30}
        ]})
    );

    let devices = api.all_devices().await.unwrap();
    let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["d1", "d2", "d3"]);
    assert!(devices[2].online);
}

#[test]
fn test_blocking_client_shares_token_cache() {
    let server_rt = tokio::runtime::Runtime::new().unwrap();
    let fake = Arc::new(FakeCloud::default());
    let addr = server_rt.block_on(start(fake.clone()));

    let api = OpenApi::new(config(addr)).unwrap();
    let blocking = api.blocking();
    blocking.connect().unwrap();
    let status = blocking.device_status("d1").unwrap();
    assert_eq!(status.len(), 2);

    // Same cache: the async handle sees the token without another grant.
    assert!(api.is_connected());
    assert_eq!(api.current_token().unwrap().access_token, "tok-1");
    assert_eq!(fake.grants.load(Ordering::SeqCst), 1);
}
