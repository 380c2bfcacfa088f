use crate::commands::CommandPublisher;
use crate::config::MqttConfig;
use crate::errors::{Error, Result};
use crate::router::Router;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub const SUBSCRIPTIONS: [&str; 2] = ["farm/#", "coordinator/+/announce"];

pub fn mqtt_options(config: &MqttConfig, client_id: String) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, config.broker.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(false);
    options
}

pub fn connect(config: &MqttConfig, client_id: String) -> (AsyncClient, EventLoop) {
    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        config.broker, config.port, client_id
    );
    AsyncClient::new(mqtt_options(config, client_id), 10000)
}

/// Subscribes and drives the event loop, handing each publish to the router
/// on its own task.
pub async fn run_mqtt(client: AsyncClient, mut eventloop: EventLoop, router: Arc<Router>) -> Result<()> {
    for topic in SUBSCRIPTIONS {
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(Error::Mqtt)?;
        info!("Subscribed to {} with QoS 1", topic);
    }

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                let router = router.clone();
                tokio::spawn(async move {
                    router.handle(&publish.topic, &publish.payload).await;
                });
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to MQTT broker: {:?}", ack.code);
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Publishes commands at QoS 1 without retain.
#[derive(Clone)]
pub struct MqttCommandPublisher {
    client: AsyncClient,
}

impl MqttCommandPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CommandPublisher for MqttCommandPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(Error::Mqtt)
    }
}
