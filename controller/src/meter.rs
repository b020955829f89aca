use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::error::MeterError;

/// Path of the net grid power inside the Tasmota `Status 10` response.
const POWER_IN_POINTER: &str = "/StatusSNS/E320/Power_in";

#[async_trait]
pub trait PowerMeter: Send + Sync {
    /// Signed net grid power in watts, positive while importing.
    async fn read_power(&self) -> Result<i32, MeterError>;
}

#[derive(Clone)]
pub struct HttpPowerMeter {
    url: String,
    client: Client,
}

impl HttpPowerMeter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, MeterError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl PowerMeter for HttpPowerMeter {
    async fn read_power(&self) -> Result<i32, MeterError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MeterError::Status(status.as_u16()));
        }

        let body: Value = response.json().await?;
        parse_power_in(&body)
    }
}

fn parse_power_in(body: &Value) -> Result<i32, MeterError> {
    let watts = body
        .pointer(POWER_IN_POINTER)
        .and_then(Value::as_f64)
        .filter(|watts| watts.is_finite())
        .ok_or(MeterError::MissingField)?;

    Ok(watts.trunc().clamp(i32::MIN as f64, i32::MAX as f64) as i32)
}
