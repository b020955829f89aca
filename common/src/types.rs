use serde::{Deserialize, Serialize};

use crate::{caps::PowerCaps, injection::InjectionDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridPowerPayload {
    #[serde(rename = "SmartMeter_currentPowerIn")]
    pub current_power_in: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    #[serde(rename = "SoC")]
    pub soc: u8,
    #[serde(rename = "PV1")]
    pub pv1: u32,
    #[serde(rename = "PV2")]
    pub pv2: u32,
    #[serde(rename = "PV_total")]
    pub pv_total: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationPayload {
    #[serde(rename = "PV_total")]
    pub pv_total: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionPayload {
    pub pwr_injection: u32,
}

/// Inbound override signal. Absent fields fall back to "permitted, no car".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverridePayload {
    #[serde(default = "default_injection_permitted")]
    pub injection_permitted: bool,
    #[serde(default)]
    pub car_charging: i32,
}

impl Default for OverridePayload {
    fn default() -> Self {
        Self {
            injection_permitted: default_injection_permitted(),
            car_charging: 0,
        }
    }
}

fn default_injection_permitted() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub soc: Option<u8>,
    #[serde(rename = "pv1Watts")]
    pub pv1_watts: Option<u32>,
    #[serde(rename = "pv2Watts")]
    pub pv2_watts: Option<u32>,
    #[serde(rename = "pvTotalWatts")]
    pub pv_total_watts: Option<u32>,
    #[serde(rename = "gridPowerWatts")]
    pub grid_power_watts: i32,
    #[serde(rename = "carCharging")]
    pub car_charging: i32,
    #[serde(rename = "injectionPermitted")]
    pub injection_permitted: bool,
    #[serde(rename = "socLowLatched")]
    pub soc_low_latched: bool,
    #[serde(rename = "injectionWatts")]
    pub injection_watts: u32,
    pub caps: Option<PowerCaps>,
    pub decision: Option<InjectionDecision>,
}
