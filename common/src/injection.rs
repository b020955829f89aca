use serde::Serialize;

use crate::{caps::PowerCaps, state::ControlState};

/// Which branch of the controller produced the new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Adjustment {
    /// Exporting while injecting: back off by the exported amount.
    ExportReduce,
    /// Exporting with injection already at zero.
    ExportIdle,
    /// Importing: injection raised towards the draw.
    ImportRaise,
    /// Importing but already at the ceiling.
    ImportHold,
    /// Importing while above a ceiling that dropped.
    ImportCapped,
    /// Grid power inside the dead band.
    DeadBand,
}

impl Adjustment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExportReduce => "EXPORT_REDUCE",
            Self::ExportIdle => "EXPORT_IDLE",
            Self::ImportRaise => "IMPORT_RAISE",
            Self::ImportHold => "IMPORT_HOLD",
            Self::ImportCapped => "IMPORT_CAPPED",
            Self::DeadBand => "DEAD_BAND",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionDecision {
    pub injection_watts: u32,
    pub previous_watts: u32,
    pub must_actuate: bool,
    pub adjustment: Adjustment,
    /// The battery-full floor lifted the value.
    pub floored: bool,
}

/// Computes the next injection command from the signed grid reading
/// (positive = import) and commits it as the controller's memory.
pub fn decide(
    grid_power: i32,
    caps: &PowerCaps,
    state: &mut ControlState,
    eps: u32,
) -> InjectionDecision {
    let last = i64::from(state.last_injection_watts());
    let grid = i64::from(grid_power);
    let eps = i64::from(eps);
    let max_power = i64::from(caps.max_power);

    let tentative = (grid + last).clamp(0, max_power);

    let (injection, adjustment) = if grid < -eps {
        if last > 0 {
            ((last + grid).max(0), Adjustment::ExportReduce)
        } else {
            (last, Adjustment::ExportIdle)
        }
    } else if grid > eps {
        let adjustment = match tentative.cmp(&last) {
            std::cmp::Ordering::Greater => Adjustment::ImportRaise,
            std::cmp::Ordering::Equal => Adjustment::ImportHold,
            std::cmp::Ordering::Less => Adjustment::ImportCapped,
        };
        (tentative, adjustment)
    } else {
        // Hold, unless the ceiling moved below the held value.
        (last.min(max_power), Adjustment::DeadBand)
    };

    let mut injection = u32::try_from(injection).unwrap_or(u32::MAX);
    let floored = injection < caps.min_power;
    if floored {
        injection = caps.min_power;
    }

    let previous_watts = state.last_injection_watts();
    let decision = InjectionDecision {
        injection_watts: injection,
        previous_watts,
        must_actuate: injection != previous_watts,
        adjustment,
        floored,
    };
    state.record_decision(decision);
    decision
}
