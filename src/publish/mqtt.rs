//! ==============================================================================
//! mqtt.rs - MQTT transport and Home Assistant autodiscovery
//! ==============================================================================
//!
//! readings go to `home/{room}/temperature` and `home/{room}/humidity` at QoS 0.
//! nothing is buffered: while the broker connection is down, or the client
//! cannot take the messages right now, the point is dropped. a background task
//! drives the connection, reconnects, and tracks whether the broker is up.
//!
//! discovery documents are retained on
//! `homeassistant/sensor/{device}_{kind}/{attribute}/config` so Home Assistant
//! picks the sensors up on its own.
//!
//! ==============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{format_value, Collector, Delivery};
use crate::config::{MqttConfig, SensorKind};
use crate::domain::DataPoint;
use crate::error::PublishError;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Serialize)]
pub struct DiscoveryDevice {
    pub identifiers: Vec<String>,
    pub name: String,
    pub model: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryDocument {
    pub name: String,
    pub unique_id: String,
    pub device_class: &'static str,
    pub state_topic: String,
    pub unit_of_measurement: &'static str,
    pub device: DiscoveryDevice,
}

fn attributes(kind: SensorKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        SensorKind::Dht22 => &[("temperature", "°C"), ("humidity", "%")],
        SensorKind::W1therm => &[("temperature", "°C")],
    }
}

/// "temperature" -> "Temperature"
fn title(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `(topic, document)` pairs announcing every attribute the sensor kind measures.
pub fn discovery_documents(
    kind: SensorKind,
    device: &str,
    sensor_name: &str,
    room: &str,
) -> Vec<(String, DiscoveryDocument)> {
    attributes(kind)
        .iter()
        .map(|&(attribute, unit)| {
            let topic = format!("homeassistant/sensor/{}_{}/{}/config", device, kind.as_str(), attribute);
            let document = DiscoveryDocument {
                name: format!("{} {}", sensor_name, title(attribute)),
                unique_id: format!("{}_{}", room, attribute),
                device_class: attribute,
                state_topic: format!("home/{}/{}", room, attribute),
                unit_of_measurement: unit,
                device: DiscoveryDevice {
                    identifiers: vec![device.to_string(), "raspberrypi".to_string()],
                    name: format!("{} {}", device, kind.as_str()),
                    model: kind.model(),
                },
            };
            (topic, document)
        })
        .collect()
}

/// Topic/payload pairs for the quantities `point` carries.
pub fn readings_messages(room: &str, point: &DataPoint) -> Vec<(String, String)> {
    let mut messages = Vec::with_capacity(2);
    if let Some(temperature) = point.temperature {
        messages.push((format!("home/{}/temperature", room), format_value(temperature)));
    }
    if let Some(humidity) = point.humidity {
        messages.push((format!("home/{}/humidity", room), format_value(humidity)));
    }
    messages
}

pub struct MqttCollector {
    client: AsyncClient,
    room: String,
    /// set on CONNACK, cleared when the event loop reports an error
    connected: Arc<AtomicBool>,
}

impl MqttCollector {
    /// Start the client; the broker connection itself is made by the background task.
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        let host = config.host.clone().ok_or_else(|| anyhow!("mqtt host missing"))?;
        let room = config.topic_room.clone().ok_or_else(|| anyhow!("mqtt topic room missing"))?;

        let mut options = MqttOptions::new(config.client_id.clone(), host.clone(), config.port);
        options.set_keep_alive(KEEP_ALIVE);
        let (client, eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        tokio::spawn(drive(eventloop, connected.clone()));

        info!(host = %host, port = config.port, room = %room, "mqtt client started");
        Ok(Self::with_client(client, room, connected))
    }

    fn with_client(client: AsyncClient, room: String, connected: Arc<AtomicBool>) -> Self {
        Self { client, room, connected }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Hand one message to the client without waiting for the broker.
    fn send(&self, topic: &str, qos: QoS, retain: bool, payload: impl Into<Vec<u8>>) -> Result<(), PublishError> {
        self.client.try_publish(topic, qos, retain, payload.into())?;
        Ok(())
    }

    /// Publish retained discovery documents at QoS 1. Failures are logged only.
    ///
    /// Called before the broker has answered; the client sends the queued
    /// documents once the connection is up.
    pub fn announce(&self, kind: SensorKind, device: &str, sensor_name: &str) {
        for (topic, document) in discovery_documents(kind, device, sensor_name, &self.room) {
            let payload = match serde_json::to_vec(&document) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(topic = %topic, error = %err, "could not encode discovery document");
                    continue;
                }
            };
            match self.send(&topic, QoS::AtLeastOnce, true, payload) {
                Ok(()) => info!(
                    unique_id = %document.unique_id,
                    device = %document.device.name,
                    "autodiscovery topic published"
                ),
                Err(err) => warn!(topic = %topic, error = %err, "autodiscovery publish failed"),
            }
        }
    }
}

impl Collector for MqttCollector {
    async fn deliver(&mut self, points: &[DataPoint]) -> Delivery {
        let Some(latest) = points.last() else {
            return Delivery::Acknowledged(0);
        };
        if !self.is_connected() {
            warn!(room = %self.room, "mqtt broker not connected; reading dropped");
            return Delivery::Dropped;
        }

        for (topic, payload) in readings_messages(&self.room, latest) {
            if let Err(err) = self.send(&topic, QoS::AtMostOnce, false, payload) {
                warn!(topic = %topic, error = %err, "mqtt publish failed");
                return Delivery::Dropped;
            }
        }
        debug!(room = %self.room, "readings queued for the broker");
        Delivery::Acknowledged(points.len())
    }
}

/// Poll the event loop forever; rumqttc reconnects on the next poll after an error.
async fn drive(mut eventloop: EventLoop, connected: Arc<AtomicBool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT broker connected");
                connected.store(true, Ordering::Release);
            }
            Ok(_) => {}
            Err(err) => {
                connected.store(false, Ordering::Release);
                warn!(error = %err, "MQTT connection dropped; reconnecting");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
