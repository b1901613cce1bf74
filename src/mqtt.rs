use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config;
use crate::dispatch::DeviceStatus;
use crate::error::TransportError;
use crate::messages::{Ingress, LifecycleState, Notification, parse_state_payload};
use crate::registry::DeviceRecord;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct StatusMqttMessage<'a> {
    address: &'a str,
    state: LifecycleState,
    last_updated_ms_ago: Option<u64>,
    last_notification_ms_ago: Option<u64>,
}

impl<'a> StatusMqttMessage<'a> {
    fn new(
        address: &'a str,
        state: LifecycleState,
        last_updated: Option<Instant>,
        last_notification: Option<Instant>,
        now: Instant,
    ) -> Self {
        let ago = |at: Option<Instant>| at.map(|at| millis(now.saturating_duration_since(at)));
        StatusMqttMessage {
            address,
            state,
            last_updated_ms_ago: ago(last_updated),
            last_notification_ms_ago: ago(last_notification),
        }
    }
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "lifecycle-push".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id,
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "lifecycle".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client.subscribe_many(self.subscriptions()).await
    }

    /// Queues the subscriptions without waiting for room in the request
    /// channel. Only the event loop drains that channel, so it must never
    /// block on it.
    fn resubscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client.try_subscribe_many(self.subscriptions())
    }

    fn subscriptions(&self) -> Vec<SubscribeFilter> {
        let device = format!("{}/device/+", self.topic_path);
        vec![
            SubscribeFilter::new(format!("{device}/state"), QoS::AtLeastOnce),
            SubscribeFilter::new(format!("{device}/query"), QoS::AtMostOnce),
            SubscribeFilter::new(format!("{device}/cancel"), QoS::AtMostOnce),
            SubscribeFilter::new(format!("{device}/test"), QoS::AtMostOnce),
            SubscribeFilter::new(format!("{}/snapshot", self.topic_path), QoS::AtMostOnce),
        ]
    }

    pub async fn event_loop(&self, eventloop: &mut rumqttc::EventLoop, tx: mpsc::Sender<Ingress>) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(message) = parse_ingress(&self.topic_path, &p.topic, &p.payload)
                        else {
                            warn!("Ignoring unrecognised message on {}", p.topic);
                            continue;
                        };

                        if tx.send(message).await.is_err() {
                            debug!("Ingress receiver dropped, stopping MQTT loop");
                            return;
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.resubscribe() {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn publish_notification(
        &self,
        notification: &Notification,
    ) -> Result<(), TransportError> {
        if !is_valid_topic_level(&notification.address) {
            return Err(TransportError::InvalidAddress);
        }
        let payload = serde_json::to_string(notification)
            .map_err(|err| TransportError::Other(err.to_string()))?;

        self.client
            .publish(
                format!("{}/device/{}/notify", self.topic_path, notification.address),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await
            .map_err(|err| TransportError::Transient(err.to_string()))
    }

    /// Replies go out with `try_publish`: the manager feeds the event loop
    /// through a bounded channel, so waiting here could stall both sides.
    pub fn publish_status(
        &self,
        address: &str,
        status: &DeviceStatus,
    ) -> anyhow::Result<()> {
        if !is_valid_topic_level(address) {
            anyhow::bail!("cannot publish status for address {:?}", address);
        }
        let message = StatusMqttMessage::new(
            address,
            status.state,
            status.last_updated,
            status.last_notification,
            Instant::now(),
        );
        self.client.try_publish(
            format!("{}/device/{}/status", self.topic_path, address),
            QoS::AtMostOnce,
            false,
            serde_json::to_string(&message)?,
        )?;
        Ok(())
    }

    pub fn publish_snapshot(&self, records: &[DeviceRecord]) -> anyhow::Result<()> {
        let now = Instant::now();
        let messages: Vec<StatusMqttMessage<'_>> = records
            .iter()
            .map(|r| {
                StatusMqttMessage::new(
                    &r.address,
                    r.lifecycle_state,
                    Some(r.state_timestamp),
                    r.last_notification,
                    now,
                )
            })
            .collect();
        info!("Publishing snapshot of {} devices", messages.len());
        self.client.try_publish(
            format!("{}/snapshot/result", self.topic_path),
            QoS::AtMostOnce,
            false,
            serde_json::to_string(&messages)?,
        )?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

impl Transport for MqttClient {
    fn send(&self, notification: Notification) -> BoxFuture<'static, Result<(), TransportError>> {
        let client = self.clone();
        async move { client.publish_notification(&notification).await }.boxed()
    }
}

/// Maps `{topic_path}/device/{address}/{action}` and `{topic_path}/snapshot`
/// onto ingress requests.
fn parse_ingress(topic_path: &str, topic: &str, payload: &[u8]) -> Option<Ingress> {
    let rest = topic.strip_prefix(topic_path)?.strip_prefix('/')?;
    if rest == "snapshot" {
        return Some(Ingress::SnapshotRequest);
    }

    let (address, action) = rest.strip_prefix("device/")?.split_once('/')?;
    if !is_valid_topic_level(address) {
        return None;
    }
    let address = address.to_string();

    match action {
        "state" => Some(Ingress::StateReport {
            address,
            state: parse_state_payload(payload)?,
        }),
        "query" => Some(Ingress::StateQuery { address }),
        "cancel" => Some(Ingress::CancelPending { address }),
        "test" => Some(Ingress::TestPush { address }),
        _ => None,
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn is_valid_topic_level(address: &str) -> bool {
    !address.is_empty()
        && !address
            .chars()
            .any(|c| matches!(c, '/' | '+' | '#') || c.is_control())
}
