//! MQTT publishing of decoded readings.
//!
//! Every reading becomes one flat JSON document on
//! `{base_topic}/{address_with_underscores}`. Delivery is QoS 0 and never
//! waits: a publish that cannot be queued is reported and forgotten, the next
//! broadcast from the sensor carries fresh values anyway.

use crate::config::MqttSettings;
use crate::mac_address::MacAddress;
use crate::reading::Reading;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Keep-alive interval announced to the broker.
const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Pause before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Requests the client may queue while the connection is down.
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// How long shutdown waits for the disconnect to go out.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize reading: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Sink for published messages.
///
/// Shared by all device pipelines, so implementations must accept concurrent
/// calls.
pub trait Publish: Send + Sync {
    /// Hand `payload` to the transport without waiting for delivery.
    fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError>;
}

/// Topic for a device: `base/aa_bb_cc_dd_ee_ff`.
pub fn topic_for(base_topic: &str, address: &MacAddress) -> String {
    format!(
        "{}/{}",
        base_topic.trim_end_matches('/'),
        address.topic_segment()
    )
}

/// The JSON document published for `reading`.
pub fn render_payload(reading: &Reading) -> Result<String, PublishError> {
    Ok(serde_json::to_string(reading)?)
}

/// Publish one reading for `address` under `base_topic`.
pub fn publish_reading(
    publisher: &dyn Publish,
    base_topic: &str,
    address: &MacAddress,
    reading: &Reading,
) -> Result<(), PublishError> {
    let topic = topic_for(base_topic, address);
    let payload = render_payload(reading)?;
    publisher.publish(&topic, payload.clone())?;
    info!(
        "Published {} data to MQTT topic {}: {}",
        reading.data.model(),
        topic,
        payload
    );
    Ok(())
}

/// Publisher backed by an `rumqttc` client.
///
/// The connection is driven by a background task that logs connection errors
/// and keeps retrying until [`MqttPublisher::shutdown`].
pub struct MqttPublisher {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
    /// Set once the broker has acknowledged a connection
    connected: Arc<AtomicBool>,
}

impl MqttPublisher {
    /// Start connecting to the broker described by `settings`.
    ///
    /// Returns immediately; messages published before the connection is up
    /// are queued by the client.
    pub fn connect(settings: &MqttSettings) -> Self {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(KEEP_ALIVE);

        if let Some((username, password)) = settings.credentials() {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        info!("Connecting to MQTT broker {}:{}", settings.host, settings.port);

        let connected = Arc::new(AtomicBool::new(false));
        Self {
            client,
            event_loop: tokio::spawn(drive_event_loop(event_loop, Arc::clone(&connected))),
            connected,
        }
    }

    /// Send a disconnect and wait briefly for the event loop to finish.
    ///
    /// The event loop task has always ended when this returns. Without a
    /// broker connection there is nothing to flush, so it is stopped at once.
    pub async fn shutdown(mut self) {
        if !self.connected.load(Ordering::Acquire) {
            debug!("MQTT broker never connected, dropping client");
            self.stop_event_loop().await;
            return;
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!("Error disconnecting MQTT client: {}", e);
        }
        match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut self.event_loop).await {
            Ok(_) => info!("MQTT connection closed"),
            Err(_) => {
                warn!("MQTT disconnect timed out");
                self.stop_event_loop().await;
            }
        }
    }

    async fn stop_event_loop(&mut self) {
        self.event_loop.abort();
        // resolves with a cancellation error once the task is gone
        let _ = (&mut self.event_loop).await;
    }
}

impl Publish for MqttPublisher {
    fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }
}

async fn drive_event_loop(mut event_loop: EventLoop, connected: Arc<AtomicBool>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                connected.store(true, Ordering::Release);
                info!("MQTT connected: {:?}", ack.code);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}. Reconnecting...", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
