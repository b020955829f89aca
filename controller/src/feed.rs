use std::time::Duration;

use pwrmgmt_common::{decode_feed_payload, feed_quota_topic, TelemetryReading};
use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, Transport};
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{ecoflow::EcoFlowClient, error::FeedError};

/// Subscription to the device's push telemetry. Decoded readings are
/// delivered over a channel; the control loop drains it every cycle.
pub struct TelemetryFeed {
    client: AsyncClient,
    topic: String,
    task: JoinHandle<()>,
}

impl TelemetryFeed {
    pub async fn open(
        api: &EcoFlowClient,
        readings: UnboundedSender<TelemetryReading>,
    ) -> Result<Self, FeedError> {
        let credentials = api.certification().await?;
        let port = credentials
            .port
            .parse::<u16>()
            .map_err(|_| FeedError::Port(credentials.port.clone()))?;

        let suffix: u32 = rand::thread_rng().gen_range(100_000..=999_999);
        let client_id = format!("{}_{suffix}", credentials.account);
        let mut options = MqttOptions::new(client_id, credentials.url.clone(), port);
        options.set_credentials(credentials.account.clone(), credentials.password.clone());
        options.set_keep_alive(Duration::from_secs(60));
        if uses_tls(&credentials.protocol) {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, 32);
        let topic = feed_quota_topic(&credentials.account, api.serial_number());
        let task = spawn_feed_loop(client.clone(), eventloop, topic.clone(), readings);

        info!(
            "telemetry feed opened on {}:{} ({topic})",
            credentials.url, port
        );
        Ok(Self {
            client,
            topic,
            task,
        })
    }

    /// Unsubscribes and disconnects, waiting briefly for the receive task.
    pub async fn close(self) {
        if let Err(err) = self.client.unsubscribe(self.topic.as_str()).await {
            warn!("telemetry feed unsubscribe failed: {err}");
        }
        if let Err(err) = self.client.disconnect().await {
            warn!("telemetry feed disconnect failed: {err}");
        }

        let mut task = self.task;
        if tokio::time::timeout(Duration::from_secs(2), &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
        info!("telemetry feed closed");
    }
}

fn uses_tls(protocol: &str) -> bool {
    !protocol.eq_ignore_ascii_case("mqtt") && !protocol.eq_ignore_ascii_case("tcp")
}

fn spawn_feed_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topic: String,
    readings: UnboundedSender<TelemetryReading>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if !forward_feed_message(&message.payload, &readings) {
                        info!("telemetry consumer gone, stopping feed");
                        break;
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("telemetry feed connected");
                    if let Err(err) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        warn!("telemetry feed subscribe failed: {err}");
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("telemetry feed poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

/// Returns false once the receiving side has been dropped.
fn forward_feed_message(payload: &[u8], readings: &UnboundedSender<TelemetryReading>) -> bool {
    match decode_feed_payload(payload) {
        Ok(reading) => {
            debug!(
                "feed update: soc {:?}, pv total {:?}",
                reading.soc,
                reading.total_generation_watts()
            );
            readings.send(reading).is_ok()
        }
        Err(err) => {
            warn!("dropping undecodable feed payload: {err}");
            true
        }
    }
}
