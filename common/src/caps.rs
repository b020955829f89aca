use chrono::Timelike;
use serde::Serialize;

pub const NIGHT_CAP_WATTS: u32 = 100;
pub const FULL_CAP_WATTS: u32 = 800;
pub const MID_SOC_CAP_WATTS: u32 = 200;
pub const LOW_SOC_CAP_WATTS: u32 = 99;

pub const SOC_LATCH_SET_BELOW: u8 = 30;
pub const SOC_LATCH_CLEAR_AT: u8 = 40;
pub const SOC_MID_FROM: u8 = 41;
pub const SOC_HIGH_ABOVE: u8 = 50;
pub const SOC_PROTECT_AT_OR_BELOW: u8 = 17;
pub const SOC_FULL_ABOVE: u8 = 85;
pub const CAR_CHARGING_ABOVE: i32 = 10;

/// Legal injection range for one control cycle, in watts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PowerCaps {
    pub min_power: u32,
    pub max_power: u32,
}

impl PowerCaps {
    /// Range used while injection is not permitted externally.
    pub const BLOCKED: PowerCaps = PowerCaps {
        min_power: 0,
        max_power: 0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapDecision {
    pub caps: PowerCaps,
    pub soc_below_30_latched: bool,
}

/// Computes injection bounds from the wall clock hour, SoC, generation and
/// the car charging level. The caller owns the latch and must store the
/// returned value.
pub fn compute_caps<T: Timelike>(
    now: &T,
    soc: Option<u8>,
    soc_below_30_latched: bool,
    total_generation: Option<u32>,
    car_charging: i32,
) -> CapDecision {
    let latched = update_latch(soc, soc_below_30_latched);
    let generation = total_generation.unwrap_or(0);

    let mut max_power = base_cap(now.hour(), soc, latched);

    if car_charging > CAR_CHARGING_ABOVE {
        max_power = scale_floor(generation, 90);
    }

    if matches!(soc, Some(soc) if soc <= SOC_PROTECT_AT_OR_BELOW) {
        max_power = scale_floor(generation, 90);
    }

    // Near full, push out almost all of the generation regardless of the
    // ceiling.
    let min_power = match soc {
        Some(soc) if soc > SOC_FULL_ABOVE => scale_floor(generation, 98),
        _ => 0,
    };

    CapDecision {
        caps: PowerCaps {
            min_power,
            max_power: max_power.max(min_power),
        },
        soc_below_30_latched: latched,
    }
}

/// Set below 30 %, cleared at 40 % or more, held in between.
fn update_latch(soc: Option<u8>, latched: bool) -> bool {
    match soc {
        Some(soc) if soc < SOC_LATCH_SET_BELOW => true,
        Some(soc) if soc >= SOC_LATCH_CLEAR_AT => false,
        _ => latched,
    }
}

fn base_cap(hour: u32, soc: Option<u8>, latched: bool) -> u32 {
    match hour {
        7..=14 => FULL_CAP_WATTS,
        15..=18 => afternoon_cap(soc, latched),
        _ => NIGHT_CAP_WATTS,
    }
}

fn afternoon_cap(soc: Option<u8>, latched: bool) -> u32 {
    let Some(soc) = soc else {
        return FULL_CAP_WATTS;
    };

    if latched {
        0
    } else if soc > SOC_HIGH_ABOVE {
        FULL_CAP_WATTS
    } else if soc >= SOC_MID_FROM {
        MID_SOC_CAP_WATTS
    } else {
        LOW_SOC_CAP_WATTS
    }
}

fn scale_floor(watts: u32, percent: u64) -> u32 {
    (u64::from(watts) * percent / 100) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use pretty_assertions::assert_eq;

    fn at(hour: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, 30, 0).unwrap()
    }

    fn caps(min_power: u32, max_power: u32) -> PowerCaps {
        PowerCaps {
            min_power,
            max_power,
        }
    }

    #[test]
    fn midday_allows_full_injection() {
        let decision = compute_caps(&at(10), Some(60), false, Some(1000), 0);

        assert_eq!(decision.caps, caps(0, 800));
        assert!(!decision.soc_below_30_latched);
    }

    #[test]
    fn night_is_conservative_and_latch_tracks_soc() {
        let decision = compute_caps(&at(20), Some(25), false, Some(3000), 0);

        assert_eq!(decision.caps, caps(0, 100));
        assert!(decision.soc_below_30_latched);

        assert_eq!(compute_caps(&at(6), None, false, None, 0).caps, caps(0, 100));
        assert_eq!(compute_caps(&at(19), None, false, None, 0).caps, caps(0, 100));
    }

    #[test]
    fn afternoon_caps_follow_soc_bands() {
        let cap_for = |soc| compute_caps(&at(16), Some(soc), false, Some(0), 0).caps.max_power;

        assert_eq!(cap_for(29), 0);
        assert_eq!(cap_for(30), 99);
        assert_eq!(cap_for(40), 99);
        assert_eq!(cap_for(41), 200);
        assert_eq!(cap_for(50), 200);
        assert_eq!(cap_for(51), 800);
        assert_eq!(
            compute_caps(&at(15), None, false, None, 0).caps.max_power,
            800
        );
    }

    #[test]
    fn afternoon_cap_is_monotonic_above_forty() {
        for hour in 15..=18 {
            let mut previous = 0;
            for soc in 40..=85 {
                let cap = compute_caps(&at(hour), Some(soc), false, Some(0), 0)
                    .caps
                    .max_power;
                assert!(cap >= previous, "hour {hour} soc {soc}: {cap} < {previous}");
                previous = cap;
            }
        }
    }

    #[test]
    fn latch_holds_zero_until_forty() {
        let mut latched = false;

        let decision = compute_caps(&at(17), Some(28), latched, Some(0), 0);
        latched = decision.soc_below_30_latched;
        assert!(latched);
        assert_eq!(decision.caps.max_power, 0);

        for soc in [32, 38, 33, 37, 39, 32] {
            let decision = compute_caps(&at(17), Some(soc), latched, Some(0), 0);
            latched = decision.soc_below_30_latched;
            assert!(latched, "unlatched at soc {soc}");
            assert_eq!(decision.caps.max_power, 0);
        }

        let decision = compute_caps(&at(17), Some(40), latched, Some(0), 0);
        assert!(!decision.soc_below_30_latched);
        assert_eq!(decision.caps.max_power, 99);
    }

    #[test]
    fn unknown_soc_keeps_latch() {
        let decision = compute_caps(&at(17), None, true, Some(0), 0);

        assert!(decision.soc_below_30_latched);
        assert_eq!(decision.caps.max_power, 800);
    }

    #[test]
    fn car_charging_limits_to_generation() {
        let decision = compute_caps(&at(10), Some(60), false, Some(1000), 11);
        assert_eq!(decision.caps, caps(0, 900));

        let decision = compute_caps(&at(10), Some(60), false, Some(1000), 10);
        assert_eq!(decision.caps, caps(0, 800));

        let decision = compute_caps(&at(10), Some(60), false, None, 20);
        assert_eq!(decision.caps, caps(0, 0));
    }

    #[test]
    fn low_soc_protection_overrides_time_of_day() {
        let decision = compute_caps(&at(12), Some(17), true, Some(333), 0);
        assert_eq!(decision.caps, caps(0, 299));

        let decision = compute_caps(&at(12), Some(18), true, Some(333), 0);
        assert_eq!(decision.caps, caps(0, 800));
    }

    #[test]
    fn full_battery_sets_floor() {
        let decision = compute_caps(&at(12), Some(90), false, Some(500), 0);
        assert_eq!(decision.caps, caps(490, 800));

        let decision = compute_caps(&at(12), Some(85), false, Some(500), 0);
        assert_eq!(decision.caps.min_power, 0);

        let decision = compute_caps(&at(12), None, false, Some(500), 0);
        assert_eq!(decision.caps.min_power, 0);
    }

    #[test]
    fn floor_lifts_ceiling_at_night() {
        let decision = compute_caps(&at(22), Some(95), false, Some(500), 0);

        assert_eq!(decision.caps, caps(490, 490));
    }

    #[test]
    fn min_never_exceeds_max() {
        let generations = [None, Some(0), Some(7), Some(250), Some(1000), Some(4321)];
        for hour in 0..24 {
            for soc in (0..=100).map(Some).chain([None]) {
                for latched in [false, true] {
                    for generation in generations {
                        for car in [0, 10, 11, 50] {
                            let caps =
                                compute_caps(&at(hour), soc, latched, generation, car).caps;
                            assert!(
                                caps.min_power <= caps.max_power,
                                "hour {hour} soc {soc:?} gen {generation:?} car {car}: {caps:?}"
                            );
                        }
                    }
                }
            }
        }
    }
}
