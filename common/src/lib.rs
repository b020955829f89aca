pub mod caps;
pub mod config;
pub mod injection;
pub mod state;
pub mod telemetry;
pub mod topics;
pub mod types;

pub use caps::{compute_caps, CapDecision, PowerCaps};
pub use config::{ConfigError, LoopFailurePolicy, RuntimeConfig};
pub use injection::{decide, Adjustment, InjectionDecision};
pub use state::ControlState;
pub use telemetry::{decode_feed_payload, TelemetryReading};
pub use topics::*;
pub use types::{
    ControllerStatus, GenerationPayload, GridPowerPayload, InjectionPayload, OverridePayload,
    TelemetryPayload,
};
