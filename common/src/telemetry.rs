use serde::Deserialize;
use serde_json::{Map, Value};

/// Quota keys are namespaced by module; the inverter reports as module `20_1`.
pub const QUOTA_PREFIX: &str = "20_1.";
pub const SOC_KEY: &str = "batSoc";
pub const PV1_KEY: &str = "pv1InputWatts";
pub const PV2_KEY: &str = "pv2InputWatts";

/// One observation of the device. PV channels are kept in deci-watts as the
/// device reports them; scaling happens in the accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetryReading {
    pub soc: Option<u8>,
    pub pv1_deciwatts: Option<u32>,
    pub pv2_deciwatts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    params: Map<String, Value>,
}

impl TelemetryReading {
    /// Reading that knows nothing. Used when a refresh fails.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn from_quota(data: &Map<String, Value>) -> Self {
        Self::extract(data, QUOTA_PREFIX)
    }

    pub fn from_feed_params(params: &Map<String, Value>) -> Self {
        Self::extract(params, "")
    }

    fn extract(data: &Map<String, Value>, prefix: &str) -> Self {
        let lookup = |key: &str| data.get(&format!("{prefix}{key}"));
        Self {
            soc: lookup(SOC_KEY).and_then(soc_value),
            pv1_deciwatts: lookup(PV1_KEY).and_then(deciwatts_value),
            pv2_deciwatts: lookup(PV2_KEY).and_then(deciwatts_value),
        }
    }

    pub fn pv1_watts(&self) -> Option<u32> {
        self.pv1_deciwatts.map(|dw| dw / 10)
    }

    pub fn pv2_watts(&self) -> Option<u32> {
        self.pv2_deciwatts.map(|dw| dw / 10)
    }

    /// Sum of both channels, floored once after scaling. Unknown unless both
    /// channels are present.
    pub fn total_generation_watts(&self) -> Option<u32> {
        match (self.pv1_deciwatts, self.pv2_deciwatts) {
            (Some(pv1), Some(pv2)) => Some(pv1.saturating_add(pv2) / 10),
            _ => None,
        }
    }
}

/// Decodes a push feed message of the form `{"params": {...}}`.
pub fn decode_feed_payload(payload: &[u8]) -> Result<TelemetryReading, serde_json::Error> {
    let envelope: FeedEnvelope = serde_json::from_slice(payload)?;
    Ok(TelemetryReading::from_feed_params(&envelope.params))
}

fn soc_value(value: &Value) -> Option<u8> {
    let soc = value.as_f64()?;
    if soc.is_finite() && (0.0..=100.0).contains(&soc) {
        Some(soc.floor() as u8)
    } else {
        None
    }
}

fn deciwatts_value(value: &Value) -> Option<u32> {
    let dw = value.as_f64()?;
    if dw.is_finite() && dw >= 0.0 && dw <= u32::MAX as f64 {
        Some(dw.floor() as u32)
    } else {
        None
    }
}
