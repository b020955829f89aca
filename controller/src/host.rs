use std::sync::Arc;

use anyhow::Context;
use pwrmgmt_common::{ControlState, RuntimeConfig};
use tokio::{signal, sync::Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    bus::{spawn_bus_loop, MqttBus},
    control_loop::{supervise, ControlContext, ControlTiming, LocalClock},
    ecoflow::{EcoFlowClient, OnlineStatus},
    error::ApiError,
    feed::TelemetryFeed,
    meter::HttpPowerMeter,
    status,
};

const CONFIG_PATH_ENV: &str = "PWRMGMT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.yaml";

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let timezone = config.timezone()?;

    let api = EcoFlowClient::new(
        config.api_url.clone(),
        config.access_key.clone(),
        config.secret_key.clone(),
        config.serial_number.clone(),
        config.http_timeout(),
    )?;
    check_device(&api).await?;

    let meter = HttpPowerMeter::new(config.url.clone(), config.http_timeout())?;
    let state = Arc::new(Mutex::new(ControlState::new()));

    let (bus, eventloop) = MqttBus::connect(&config);
    let bus_task = spawn_bus_loop(bus.clone(), state.clone(), eventloop, config.topic_in.clone());
    info!(
        "bus client for {}:{} publishing to {}",
        config.mqtt_host, config.mqtt_port, config.topic_out
    );

    let (feed_tx, feed_rx) = tokio::sync::mpsc::unbounded_channel();
    let feed = match TelemetryFeed::open(&api, feed_tx).await {
        Ok(feed) => Some(feed),
        Err(err) => {
            warn!("telemetry feed unavailable, relying on periodic refresh: {err}");
            None
        }
    };

    let ctx = ControlContext::new(
        state.clone(),
        Arc::new(api),
        Arc::new(meter),
        Arc::new(bus.clone()),
        Arc::new(LocalClock::new(timezone)),
        ControlTiming::from_config(&config),
    );

    let poller = ctx.spawn_meter_poller();
    let status_task = config.status_port.map(|port| {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = status::serve(state, port).await {
                error!("status server stopped: {err:#}");
            }
        })
    });

    let outcome = tokio::select! {
        result = supervise(ctx, feed_rx, config.loop_failure, config.restart_delay()) => {
            result.context("control loop stopped")
        }
        _ = shutdown_signal() => Ok(()),
    };

    info!("shutting down");
    poller.abort();
    if let Some(task) = status_task {
        task.abort();
    }
    if let Some(feed) = feed {
        feed.close().await;
    }
    if let Err(err) = bus.disconnect().await {
        warn!("bus disconnect failed: {err}");
    }
    bus_task.abort();

    outcome
}

fn load_config() -> anyhow::Result<RuntimeConfig> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = RuntimeConfig::load(&path)?;
    config.apply_env_overrides();
    config
        .validate()
        .with_context(|| format!("invalid configuration in {path}"))?;
    info!("configuration loaded from {path}");
    Ok(config)
}

/// An unknown serial number stops startup; other failures only warn.
async fn check_device(api: &EcoFlowClient) -> anyhow::Result<()> {
    match api.online_status(api.serial_number()).await {
        Ok(status @ OnlineStatus::Online) => {
            info!("device {} is {}", api.serial_number(), status.as_str())
        }
        Ok(status @ OnlineStatus::Offline) => {
            warn!("device {} is {}", api.serial_number(), status.as_str())
        }
        Err(err @ ApiError::DeviceNotFound(_)) => {
            return Err(err).context("device is not registered to this account")
        }
        Err(err) => warn!("device online check failed: {err}"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Ctrl+C handler unavailable: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("SIGTERM handler unavailable: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
