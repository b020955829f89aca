use std::{sync::Arc, time::Duration};

use chrono::{Local, NaiveDateTime, Utc};
use chrono_tz::Tz;
use pwrmgmt_common::{
    decide, Adjustment, ControlState, GenerationPayload, GridPowerPayload, InjectionDecision,
    InjectionPayload, LoopFailurePolicy, PowerCaps, RuntimeConfig, TelemetryReading,
};
use tokio::{
    sync::{mpsc::UnboundedReceiver, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{error, info, warn};

use crate::{
    bus::{publish_payload, Publisher},
    ecoflow::DeviceApi,
    error::ControlError,
    meter::PowerMeter,
};

/// Source of the wall clock used by the cap policy.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

pub struct LocalClock {
    timezone: Option<Tz>,
}

impl LocalClock {
    pub fn new(timezone: Option<Tz>) -> Self {
        Self { timezone }
    }
}

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        match self.timezone {
            Some(tz) => Utc::now().with_timezone(&tz).naive_local(),
            None => Local::now().naive_local(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTiming {
    pub sleep_time: Duration,
    pub min_change_interval: Duration,
    pub hysteresis_interval: Duration,
    pub soc_refresh_interval: Duration,
    pub eps: u32,
}

impl ControlTiming {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            sleep_time: config.sleep_time(),
            min_change_interval: config.min_change_interval(),
            hysteresis_interval: config.hysteresis_interval(),
            soc_refresh_interval: config.soc_refresh_interval(),
            eps: config.eps,
        }
    }

    /// Pause before the next decision. The two intervals are configured
    /// independently.
    pub fn next_sleep(&self, last_injection_watts: u32) -> Duration {
        if last_injection_watts != 0 {
            self.hysteresis_interval
        } else {
            self.sleep_time
        }
    }
}

/// Everything the poller and the main loop share.
#[derive(Clone)]
pub struct ControlContext {
    state: Arc<Mutex<ControlState>>,
    api: Arc<dyn DeviceApi>,
    meter: Arc<dyn PowerMeter>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    timing: ControlTiming,
    origin: Instant,
}

impl ControlContext {
    pub fn new(
        state: Arc<Mutex<ControlState>>,
        api: Arc<dyn DeviceApi>,
        meter: Arc<dyn PowerMeter>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        timing: ControlTiming,
    ) -> Self {
        Self {
            state,
            api,
            meter,
            publisher,
            clock,
            timing,
            origin: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    pub async fn poll_meter(&self) -> Result<i32, ControlError> {
        let watts = self.meter.read_power().await?;
        self.state.lock().await.set_grid_power(watts);

        let payload = GridPowerPayload {
            current_power_in: watts,
        };
        if let Err(err) = publish_payload(self.publisher.as_ref(), &payload).await {
            warn!("grid power publish failed: {err}");
        }
        Ok(watts)
    }

    /// Pulls a full snapshot from the device API. A failed pull leaves SoC
    /// and PV unknown.
    pub async fn refresh_telemetry(&self) {
        let reading = match self.api.get_full_quota().await {
            Ok(data) => TelemetryReading::from_quota(&data),
            Err(err) => {
                warn!("telemetry refresh failed: {err}");
                TelemetryReading::unknown()
            }
        };

        let now_ms = self.now_ms();
        let payload = {
            let mut state = self.state.lock().await;
            state.apply_refresh(reading, now_ms);
            state.telemetry_payload()
        };

        info!(
            "SoC: {:?}%, PV1: {:?} W, PV2: {:?} W, total: {:?} W",
            reading.soc,
            reading.pv1_watts(),
            reading.pv2_watts(),
            reading.total_generation_watts()
        );

        match payload {
            Some(payload) => {
                if let Err(err) = publish_payload(self.publisher.as_ref(), &payload).await {
                    warn!("telemetry publish failed: {err}");
                }
            }
            None => warn!("telemetry incomplete, not publishing"),
        }
    }

    /// Applies every queued feed update without waiting for new ones.
    pub async fn drain_feed(&self, feed: &mut UnboundedReceiver<TelemetryReading>) {
        while let Ok(reading) = feed.try_recv() {
            let changed = self.state.lock().await.apply_feed(reading);
            if let Some(pv_total) = changed {
                info!("feed update: total PV {pv_total} W, SoC {:?}", reading.soc);
                let payload = GenerationPayload { pv_total };
                if let Err(err) = publish_payload(self.publisher.as_ref(), &payload).await {
                    warn!("generation publish failed: {err}");
                }
            }
        }
    }

    /// One decision: caps, controller, actuation if needed, publish.
    pub async fn run_cycle(&self) -> Result<InjectionDecision, ControlError> {
        let now = self.clock.now();
        let (decision, caps, grid_power) = {
            let mut state = self.state.lock().await;
            let caps = state.current_caps(&now);
            let grid_power = state.grid_power_watts();
            let decision = decide(grid_power, &caps, &mut state, self.timing.eps);
            (decision, caps, grid_power)
        };

        info!(
            adjustment = decision.adjustment.as_str(),
            "inject power range ({}, {}), grid {} W",
            caps.min_power,
            caps.max_power,
            grid_power
        );
        log_decision(&decision, grid_power, &caps);

        if decision.must_actuate {
            if let Err(err) = self.api.set_injection_power(decision.injection_watts).await {
                self.state
                    .lock()
                    .await
                    .restore_injection(decision.previous_watts);
                return Err(err.into());
            }
            info!("battery output set to {} W", decision.injection_watts);
        }

        let payload = InjectionPayload {
            pwr_injection: decision.injection_watts,
        };
        if let Err(err) = publish_payload(self.publisher.as_ref(), &payload).await {
            warn!("injection publish failed: {err}");
        }

        Ok(decision)
    }

    /// Establishes a known device state before the steady loop starts.
    pub async fn startup(&self) -> Result<(), ControlError> {
        self.refresh_telemetry().await;

        let watts = self.poll_meter().await?;
        let last = self.state.lock().await.last_injection_watts();
        info!("initial grid power {watts} W, current injection {last} W");

        self.run_cycle().await?;
        info!(
            "initial setting done, sleeping {}s",
            self.timing.min_change_interval.as_secs()
        );
        tokio::time::sleep(self.timing.min_change_interval).await;
        Ok(())
    }

    /// Runs until a fatal error. Transient cycle failures are logged and
    /// the loop continues on the next tick.
    pub async fn run_main_loop(
        &self,
        feed: &mut UnboundedReceiver<TelemetryReading>,
    ) -> Result<(), ControlError> {
        self.startup().await?;

        let refresh_ms: u64 = self
            .timing
            .soc_refresh_interval
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX);

        loop {
            self.drain_feed(feed).await;

            let refresh_due = self.state.lock().await.refresh_due(self.now_ms(), refresh_ms);
            if refresh_due {
                self.refresh_telemetry().await;
            }

            match self.run_cycle().await {
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!("control cycle failed: {err}"),
            }

            let last = self.state.lock().await.last_injection_watts();
            tokio::time::sleep(self.timing.next_sleep(last)).await;
        }
    }

    /// Fast meter poller, independent of the main loop.
    pub fn spawn_meter_poller(&self) -> JoinHandle<()> {
        let ctx = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = ctx.poll_meter().await {
                    warn!("meter poll failed: {err}");
                }
                tokio::time::sleep(ctx.timing.sleep_time).await;
            }
        })
    }
}

/// Restarts the main loop after failures unless the error is fatal or the
/// policy says to exit.
pub async fn supervise(
    ctx: ControlContext,
    mut feed: UnboundedReceiver<TelemetryReading>,
    policy: LoopFailurePolicy,
    restart_delay: Duration,
) -> Result<(), ControlError> {
    loop {
        let Err(err) = ctx.run_main_loop(&mut feed).await else {
            return Ok(());
        };

        error!("control loop terminated: {err}");
        if err.is_fatal() || policy == LoopFailurePolicy::Exit {
            return Err(err);
        }

        warn!("restarting control loop in {}s", restart_delay.as_secs());
        tokio::time::sleep(restart_delay).await;
    }
}

fn log_decision(decision: &InjectionDecision, grid_power: i32, caps: &PowerCaps) {
    let watts = decision.injection_watts;
    match decision.adjustment {
        Adjustment::ExportReduce => {
            info!("adjusting injection to {watts} W due to export of {} W", -grid_power)
        }
        Adjustment::ExportIdle => {
            info!("exporting {} W with injection already at 0, no change needed", -grid_power)
        }
        Adjustment::ImportRaise | Adjustment::ImportCapped => {
            info!("changing injection to {watts} W due to import of {grid_power} W")
        }
        Adjustment::ImportHold => {
            info!("importing {grid_power} W but injection already at {watts} W, no change needed")
        }
        Adjustment::DeadBand => {
            info!("grid power {grid_power} W within dead band, no change needed")
        }
    }

    if decision.floored {
        info!("battery nearly full, injection raised to {} W", caps.min_power);
    }
}
