use chrono::Timelike;

use crate::{
    caps::{compute_caps, PowerCaps},
    injection::InjectionDecision,
    telemetry::TelemetryReading,
    types::{ControllerStatus, OverridePayload, TelemetryPayload},
};

/// Everything the controller knows about the installation. One instance
/// lives for the whole process and is shared behind a mutex.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    soc: Option<u8>,
    pv1_deciwatts: Option<u32>,
    pv2_deciwatts: Option<u32>,
    grid_power_watts: i32,
    car_charging_level: i32,
    injection_permitted: bool,
    soc_below_30_latched: bool,
    last_injection_watts: u32,
    last_soc_refresh_ms: Option<u64>,
    last_caps: Option<PowerCaps>,
    last_decision: Option<InjectionDecision>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlState {
    /// Assumed output before the first decision. It matches no settled
    /// command, so a first decision outside the dead band is always sent.
    /// Inside the dead band the seed is held and nothing is sent.
    pub const INITIAL_INJECTION_WATTS: u32 = 1;

    pub fn new() -> Self {
        Self {
            soc: None,
            pv1_deciwatts: None,
            pv2_deciwatts: None,
            grid_power_watts: 0,
            car_charging_level: 0,
            injection_permitted: true,
            soc_below_30_latched: false,
            last_injection_watts: Self::INITIAL_INJECTION_WATTS,
            last_soc_refresh_ms: None,
            last_caps: None,
            last_decision: None,
        }
    }

    pub fn soc(&self) -> Option<u8> {
        self.soc
    }

    pub fn pv_generation_watts(&self) -> Option<u32> {
        self.pv_reading().total_generation_watts()
    }

    fn pv_reading(&self) -> TelemetryReading {
        TelemetryReading {
            soc: self.soc,
            pv1_deciwatts: self.pv1_deciwatts,
            pv2_deciwatts: self.pv2_deciwatts,
        }
    }

    pub fn grid_power_watts(&self) -> i32 {
        self.grid_power_watts
    }

    pub fn car_charging_level(&self) -> i32 {
        self.car_charging_level
    }

    pub fn injection_permitted(&self) -> bool {
        self.injection_permitted
    }

    pub fn soc_below_30_latched(&self) -> bool {
        self.soc_below_30_latched
    }

    pub fn last_injection_watts(&self) -> u32 {
        self.last_injection_watts
    }

    pub fn set_grid_power(&mut self, watts: i32) {
        self.grid_power_watts = watts;
    }

    /// Replaces SoC and PV with a full snapshot. Missing values become
    /// unknown instead of keeping stale ones.
    pub fn apply_refresh(&mut self, reading: TelemetryReading, now_ms: u64) {
        self.soc = reading.soc;
        self.pv1_deciwatts = reading.pv1_deciwatts;
        self.pv2_deciwatts = reading.pv2_deciwatts;
        self.last_soc_refresh_ms = Some(now_ms);
    }

    pub fn refresh_due(&self, now_ms: u64, interval_ms: u64) -> bool {
        self.last_soc_refresh_ms
            .map(|last| now_ms.saturating_sub(last) >= interval_ms)
            .unwrap_or(true)
    }

    /// Applies a push feed update. Only the values the update carries are
    /// replaced. Returns the new total generation when it changed to a
    /// known value.
    pub fn apply_feed(&mut self, reading: TelemetryReading) -> Option<u32> {
        let previous = self.pv_generation_watts();

        if reading.soc.is_some() {
            self.soc = reading.soc;
        }
        if reading.pv1_deciwatts.is_some() {
            self.pv1_deciwatts = reading.pv1_deciwatts;
        }
        if reading.pv2_deciwatts.is_some() {
            self.pv2_deciwatts = reading.pv2_deciwatts;
        }

        match self.pv_generation_watts() {
            Some(total) if previous != Some(total) => Some(total),
            _ => None,
        }
    }

    pub fn apply_override(&mut self, payload: &OverridePayload) {
        self.injection_permitted = payload.injection_permitted;
        self.car_charging_level = payload.car_charging;
    }

    /// Evaluates the cap policy for `now`, storing the updated latch. A
    /// withdrawn injection permit pins the range to zero.
    pub fn current_caps<T: Timelike>(&mut self, now: &T) -> PowerCaps {
        let decision = compute_caps(
            now,
            self.soc,
            self.soc_below_30_latched,
            self.pv_generation_watts(),
            self.car_charging_level,
        );
        self.soc_below_30_latched = decision.soc_below_30_latched;

        let caps = if self.injection_permitted {
            decision.caps
        } else {
            PowerCaps::BLOCKED
        };
        self.last_caps = Some(caps);
        caps
    }

    pub(crate) fn record_decision(&mut self, decision: InjectionDecision) {
        self.last_injection_watts = decision.injection_watts;
        self.last_decision = Some(decision);
    }

    /// Rolls the injection memory back after a command could not be
    /// delivered, so the next cycle sends it again.
    pub fn restore_injection(&mut self, watts: u32) {
        self.last_injection_watts = watts;
    }

    pub fn telemetry_payload(&self) -> Option<TelemetryPayload> {
        let pv = self.pv_reading();
        Some(TelemetryPayload {
            soc: self.soc?,
            pv1: pv.pv1_watts()?,
            pv2: pv.pv2_watts()?,
            pv_total: pv.total_generation_watts()?,
        })
    }

    pub fn status(&self) -> ControllerStatus {
        let pv = self.pv_reading();
        ControllerStatus {
            soc: self.soc,
            pv1_watts: pv.pv1_watts(),
            pv2_watts: pv.pv2_watts(),
            pv_total_watts: pv.total_generation_watts(),
            grid_power_watts: self.grid_power_watts,
            car_charging: self.car_charging_level,
            injection_permitted: self.injection_permitted,
            soc_low_latched: self.soc_below_30_latched,
            injection_watts: self.last_injection_watts,
            caps: self.last_caps,
            decision: self.last_decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{injection::decide, telemetry::decode_feed_payload};
    use chrono::NaiveTime;
    use pretty_assertions::assert_eq;

    fn reading(soc: Option<u8>, pv1: Option<u32>, pv2: Option<u32>) -> TelemetryReading {
        TelemetryReading {
            soc,
            pv1_deciwatts: pv1,
            pv2_deciwatts: pv2,
        }
    }

    #[test]
    fn starts_unknown_with_seeded_injection() {
        let state = ControlState::new();

        assert_eq!(state.soc(), None);
        assert_eq!(state.pv_generation_watts(), None);
        assert!(state.injection_permitted());
        assert!(!state.soc_below_30_latched());
        assert_eq!(state.last_injection_watts(), 1);
        assert!(state.refresh_due(0, 240_000));
    }

    #[test]
    fn refresh_replaces_everything_and_resets_on_failure() {
        let mut state = ControlState::new();
        state.apply_refresh(reading(Some(64), Some(1500), Some(500)), 1_000);

        assert_eq!(state.soc(), Some(64));
        assert_eq!(state.pv_generation_watts(), Some(200));
        assert_eq!(
            state.telemetry_payload(),
            Some(TelemetryPayload {
                soc: 64,
                pv1: 150,
                pv2: 50,
                pv_total: 200,
            })
        );
        assert!(!state.refresh_due(240_999, 240_000));
        assert!(state.refresh_due(241_000, 240_000));

        state.apply_refresh(TelemetryReading::unknown(), 241_000);

        assert_eq!(state.soc(), None);
        assert_eq!(state.pv_generation_watts(), None);
        assert_eq!(state.telemetry_payload(), None);
        assert!(!state.refresh_due(480_999, 240_000));
    }

    #[test]
    fn feed_reports_only_changed_totals() {
        let mut state = ControlState::new();

        assert_eq!(state.apply_feed(reading(Some(50), Some(1000), Some(0))), Some(100));
        assert_eq!(state.apply_feed(reading(None, Some(1000), Some(0))), None);
        assert_eq!(state.soc(), Some(50));
        assert_eq!(state.apply_feed(reading(None, Some(1000), Some(20))), Some(102));
        assert_eq!(state.apply_feed(reading(None, None, Some(40))), Some(104));
        assert_eq!(state.pv_generation_watts(), Some(104));
        assert_eq!(state.apply_feed(reading(None, Some(1000), None)), None);
    }

    #[test]
    fn partial_feed_needs_both_channels_before_reporting() {
        let mut state = ControlState::new();

        assert_eq!(state.apply_feed(reading(None, Some(1000), None)), None);
        assert_eq!(state.pv_generation_watts(), None);
        assert_eq!(state.apply_feed(reading(None, None, Some(500))), Some(150));
    }

    #[test]
    fn soc_only_feed_keeps_generation_and_full_battery_floor() {
        let morning = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        let mut state = ControlState::new();
        state.apply_refresh(reading(Some(90), Some(3000), Some(2000)), 0);
        assert_eq!(
            state.current_caps(&morning),
            PowerCaps {
                min_power: 490,
                max_power: 800,
            }
        );

        let update = decode_feed_payload(br#"{"params":{"batSoc":91}}"#).unwrap();
        assert_eq!(state.apply_feed(update), None);

        assert_eq!(state.soc(), Some(91));
        assert_eq!(state.pv_generation_watts(), Some(500));
        assert_eq!(
            state.current_caps(&morning),
            PowerCaps {
                min_power: 490,
                max_power: 800,
            }
        );
    }

    #[test]
    fn status_exposes_last_decision() {
        let mut state = ControlState::new();
        state.set_grid_power(120);
        let caps = state.current_caps(&NaiveTime::from_hms_opt(10, 0, 0).unwrap());

        let decision = decide(120, &caps, &mut state, 5);

        let status = state.status();
        assert_eq!(status.decision, Some(decision));
        assert_eq!(status.injection_watts, 121);
    }

    #[test]
    fn caps_store_latch_and_honor_permit() {
        let afternoon = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
        let mut state = ControlState::new();
        state.apply_refresh(reading(Some(25), Some(0), Some(0)), 0);

        assert_eq!(state.current_caps(&afternoon).max_power, 0);
        assert!(state.soc_below_30_latched());

        state.apply_refresh(reading(Some(35), Some(0), Some(0)), 1);
        assert_eq!(state.current_caps(&afternoon).max_power, 0);

        state.apply_refresh(reading(Some(60), Some(0), Some(0)), 2);
        assert_eq!(state.current_caps(&afternoon).max_power, 800);

        state.apply_override(&OverridePayload {
            injection_permitted: false,
            car_charging: 0,
        });
        assert_eq!(state.current_caps(&afternoon), PowerCaps::BLOCKED);
        assert_eq!(state.status().caps, Some(PowerCaps::BLOCKED));
    }
}
