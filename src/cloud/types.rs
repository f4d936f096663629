//! Serde shapes of the OpenAPI envelope and the resources this crate reads.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Common response envelope: `{success, result, code?, msg?, t}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub msg: Option<String>,
    /// Server time in epoch milliseconds
    #[serde(default)]
    pub t: i64,
}

/// Result of both token endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResult {
    pub access_token: String,
    pub refresh_token: String,
    pub uid: String,
    /// Lifetime in seconds
    #[serde(alias = "expire")]
    pub expire_time: i64,
}

/// Scalar data-point value. Arrays and objects are rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DataPointValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl<'de> Deserialize<'de> for DataPointValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        match Value::deserialize(deserializer)? {
            Value::Bool(b) => Ok(DataPointValue::Bool(b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(DataPointValue::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(DataPointValue::Float(f))
                } else {
                    Err(D::Error::custom(format!("unrepresentable number {}", n)))
                }
            }
            Value::String(s) => Ok(DataPointValue::String(s)),
            other => Err(D::Error::custom(format!(
                "data point value must be a scalar, got {}",
                other
            ))),
        }
    }
}

/// One data point as reported by the cloud (REST status or Pulsar event).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPointStatus {
    pub code: String,
    #[serde(default)]
    pub value: Option<DataPointValue>,
    /// Local DP index, present on some Pulsar events
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "dps_index")]
    pub dps: Option<String>,
}

// Pulsar sends the index as a number, some REST answers as a string.
fn dps_index<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Device as listed by the user/associated-users endpoints and `device_detail`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceDetail {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub local_key: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub sub: bool,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub create_time: Option<i64>,
    #[serde(default)]
    pub update_time: Option<i64>,
    #[serde(default)]
    pub active_time: Option<i64>,
    #[serde(default)]
    pub status: Vec<DataPointStatus>,
}

/// One page of `/v1.0/iot-01/associated-users/devices`.
#[derive(Debug, Clone, Deserialize)]
pub struct DevicesPage {
    #[serde(alias = "devices", default)]
    pub list: Vec<DeviceDetail>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub last_row_key: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// Instruction or status set of a category.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceFunction {
    pub code: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// JSON-encoded value constraints, kept verbatim
    #[serde(default)]
    pub values: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceSpecification {
    pub category: String,
    #[serde(default)]
    pub functions: Vec<DeviceFunction>,
    #[serde(default)]
    pub status: Vec<DeviceFunction>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceFactoryInfo {
    pub id: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub sn: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

/// Sub-device of a gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceChild {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// Entry of a `commands` POST body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceCommand {
    pub code: String,
    pub value: Value,
}

impl DeviceCommand {
    pub fn new<S: Into<String>, V: Into<Value>>(code: S, value: V) -> Self {
        Self {
            code: code.into(),
            value: value.into(),
        }
    }
}
