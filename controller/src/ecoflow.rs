use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::error::ApiError;

const DEVICE_LIST_PATH: &str = "iot-open/sign/device/list";
const QUOTA_ALL_PATH: &str = "iot-open/sign/device/quota/all";
const QUOTA_PATH: &str = "iot-open/sign/device/quota";
const CERTIFICATION_PATH: &str = "iot-open/sign/certification";

const SET_PERMANENT_WATTS_CMD: &str = "WN511_SET_PERMANENT_WATTS_PACK";

/// The part of the cloud API the control loop depends on.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn get_full_quota(&self) -> Result<Map<String, Value>, ApiError>;
    async fn set_injection_power(&self, watts: u32) -> Result<(), ApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceInfo {
    pub sn: String,
    #[serde(default)]
    pub online: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineStatus {
    Online,
    Offline,
}

impl OnlineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// Broker credentials for the device push feed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedCredentials {
    #[serde(rename = "certificateAccount")]
    pub account: String,
    #[serde(rename = "certificatePassword")]
    pub password: String,
    pub url: String,
    pub port: String,
    #[serde(default)]
    pub protocol: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: Value,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Signed client for the EcoFlow open API.
#[derive(Clone)]
pub struct EcoFlowClient {
    base_url: String,
    access_key: String,
    secret_key: String,
    serial_number: String,
    client: Client,
}

impl EcoFlowClient {
    pub fn new(
        base_url: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        serial_number: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            serial_number: serial_number.into(),
            client,
        })
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ApiError> {
        self.get_signed(DEVICE_LIST_PATH, None).await
    }

    /// Fails with `DeviceNotFound` when the account does not know `sn`.
    pub async fn online_status(&self, sn: &str) -> Result<OnlineStatus, ApiError> {
        let devices = self.list_devices().await?;
        let device = devices
            .iter()
            .find(|device| device.sn == sn)
            .ok_or_else(|| ApiError::DeviceNotFound(sn.to_string()))?;

        Ok(if device.online == 1 {
            OnlineStatus::Online
        } else {
            OnlineStatus::Offline
        })
    }

    pub async fn certification(&self) -> Result<FeedCredentials, ApiError> {
        self.get_signed(CERTIFICATION_PATH, None).await
    }

    async fn get_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Option<Value>,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path);
        let headers = self.signed_headers(params.as_ref());

        let mut request = self.client.get(&url);
        if let Some(params) = &params {
            request = request.query(&flatten_params(params));
        }
        for (name, value) in headers {
            request = request.header(name, value);
        }

        debug!("device api GET {url}");
        let response = request.send().await?;
        let data = read_envelope(response).await?;
        serde_json::from_value(data).map_err(|err| ApiError::Decode(err.to_string()))
    }

    async fn put_signed(&self, path: &str, body: Value) -> Result<(), ApiError> {
        let url = self.endpoint(path);
        let headers = self.signed_headers(Some(&body));

        let mut request = self.client.put(&url).json(&body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        debug!("device api PUT {url}");
        let response = request.send().await?;
        read_envelope(response).await.map(|_| ())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn signed_headers(&self, params: Option<&Value>) -> Vec<(&'static str, String)> {
        let nonce = rand::thread_rng().gen_range(100_000..=999_999).to_string();
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let payload = signing_payload(params, &self.access_key, &nonce, &timestamp);
        let sign = hmac_hex(&payload, &self.secret_key);

        vec![
            ("accessKey", self.access_key.clone()),
            ("nonce", nonce),
            ("timestamp", timestamp),
            ("sign", sign),
        ]
    }
}

#[async_trait]
impl DeviceApi for EcoFlowClient {
    async fn get_full_quota(&self) -> Result<Map<String, Value>, ApiError> {
        let params = json!({ "sn": self.serial_number });
        self.get_signed(QUOTA_ALL_PATH, Some(params)).await
    }

    /// The device takes the permanent output in deci-watts.
    async fn set_injection_power(&self, watts: u32) -> Result<(), ApiError> {
        match self.online_status(&self.serial_number).await? {
            OnlineStatus::Online => {}
            OnlineStatus::Offline => {
                warn!("device {} is offline, sending command anyway", self.serial_number)
            }
        }

        info!("setting permanent output to {watts} W");
        let body = json!({
            "sn": self.serial_number,
            "cmdCode": SET_PERMANENT_WATTS_CMD,
            "params": { "permanentWatts": u64::from(watts) * 10 },
        });
        self.put_signed(QUOTA_PATH, body).await
    }
}

async fn read_envelope(response: Response) -> Result<Value, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let envelope: Envelope = response.json().await?;
    if !code_is_success(&envelope.code) {
        return Err(ApiError::Api {
            code: scalar_to_string(&envelope.code),
            message: envelope.message.unwrap_or_default(),
        });
    }

    Ok(envelope.data.unwrap_or(Value::Null))
}

fn code_is_success(code: &Value) -> bool {
    match code {
        Value::String(code) => code == "0",
        Value::Number(code) => code.as_i64() == Some(0),
        _ => false,
    }
}

/// Flattens nested parameters into `a.b` / `a[0]` keys, sorted.
pub(crate) fn flatten_params(params: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    flatten_into(params, String::new(), &mut out);
    out
}

fn flatten_into(value: &Value, prefix: String, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(nested, path, out);
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                flatten_into(nested, format!("{prefix}[{index}]"), out);
            }
        }
        scalar => {
            out.insert(prefix, scalar_to_string(scalar));
        }
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn query_string<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// String covered by the request signature: sorted parameters, then the
/// sorted auth headers.
pub(crate) fn signing_payload(
    params: Option<&Value>,
    access_key: &str,
    nonce: &str,
    timestamp: &str,
) -> String {
    let auth = query_string([
        ("accessKey", access_key),
        ("nonce", nonce),
        ("timestamp", timestamp),
    ]);

    let flattened = params.map(flatten_params).unwrap_or_default();
    if flattened.is_empty() {
        return auth;
    }

    let params = query_string(
        flattened
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str())),
    );
    format!("{params}&{auth}")
}

pub(crate) fn hmac_hex(payload: &str, secret_key: &str) -> String {
    hex::encode(hmac_sha256::HMAC::mac(payload.as_bytes(), secret_key.as_bytes()))
}
