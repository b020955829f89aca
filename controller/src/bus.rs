use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use pwrmgmt_common::{ControlState, OverridePayload, RuntimeConfig};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{info, warn};

use crate::error::BusError;

const MAX_BUS_PAYLOAD_BYTES: usize = 4 * 1024;
const BUS_CLIENT_ID: &str = "rg_pwrMgmt";

/// Outbound side of the message bus.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, payload: Value) -> Result<(), BusError>;
}

pub async fn publish_payload<T: Serialize + Sync>(
    publisher: &dyn Publisher,
    payload: &T,
) -> Result<(), BusError> {
    let body = serde_json::to_value(payload)?;
    publisher.publish(body).await
}

#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    topic_out: String,
}

impl MqttBus {
    pub fn connect(config: &RuntimeConfig) -> (Self, EventLoop) {
        let mut options =
            MqttOptions::new(BUS_CLIENT_ID, config.mqtt_host.clone(), config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(60));
        if !config.mqtt_user.is_empty() {
            options.set_credentials(config.mqtt_user.clone(), config.mqtt_pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        (
            Self {
                client,
                topic_out: config.topic_out.clone(),
            },
            eventloop,
        )
    }

    pub async fn disconnect(&self) -> Result<(), BusError> {
        self.client.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for MqttBus {
    /// Queues the message without waiting. While the broker is unreachable
    /// the request queue fills up and further messages are dropped with an
    /// error.
    async fn publish(&self, payload: Value) -> Result<(), BusError> {
        let body = serde_json::to_vec(&payload)?;
        self.client
            .try_publish(&self.topic_out, QoS::AtMostOnce, false, body)?;
        Ok(())
    }
}

/// Drives the bus connection and applies inbound override messages. The
/// override topic is (re)subscribed on every connect.
pub fn spawn_bus_loop(
    bus: MqttBus,
    state: Arc<Mutex<ControlState>>,
    mut eventloop: EventLoop,
    topic_in: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_bus_message(&state, &topic_in, &message.topic, &message.payload)
                            .await
                    {
                        warn!("bus message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("bus connected");
                    if let Err(err) = bus.client.try_subscribe(topic_in.as_str(), QoS::AtMostOnce)
                    {
                        warn!("bus subscribe to {topic_in} failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("bus poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

async fn handle_bus_message(
    state: &Mutex<ControlState>,
    topic_in: &str,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if topic != topic_in {
        return Ok(());
    }

    if payload.len() > MAX_BUS_PAYLOAD_BYTES {
        warn!(
            "dropping oversized bus payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let overrides: OverridePayload =
        serde_json::from_slice(payload).context("failed to decode override payload")?;
    state.lock().await.apply_override(&overrides);
    info!(
        "bus override received: injection_permitted = {}, car_charging = {}",
        overrides.injection_permitted, overrides.car_charging
    );
    Ok(())
}
