//! ==============================================================================
//! home_assistant.rs - Home Assistant state API transport
//! ==============================================================================
//!
//! each attribute of the newest point is its own entity, overwritten with one
//! POST per attribute:
//!
//!     POST /api/states/sensor.fridge_{name}_temperature
//!     POST /api/states/sensor.fridge_{name}_humidity
//!     POST /api/states/binary_sensor.fridge_{name}_power
//!     POST /api/states/binary_sensor.fridge_{name}_fan
//!
//! attributes succeed or fail on their own; nothing is rolled back. older
//! points are never replayed since the next cycle overwrites the same entities.
//!
//! ==============================================================================

use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{format_value, Collector, Delivery};
use crate::config::slugify;
use crate::domain::{CollectorEndpoint, DataPoint};
use crate::error::PublishError;

#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub entity_id: String,
    pub body: Value,
}

/// Entity updates for one point, skipping quantities it does not carry.
pub fn state_updates(name: &str, point: &DataPoint) -> Vec<StateUpdate> {
    let mut updates = Vec::with_capacity(4);
    let friendly = |what: &str| format!("Fridge {} {}", name, what);

    if let Some(temperature) = point.temperature {
        updates.push(StateUpdate {
            entity_id: format!("sensor.fridge_{}_temperature", name),
            body: json!({
                "state": format_value(temperature),
                "attributes": {
                    "unit_of_measurement": "°C",
                    "device_class": "temperature",
                    "friendly_name": friendly("Temperature"),
                },
            }),
        });
    }
    if let Some(humidity) = point.humidity {
        updates.push(StateUpdate {
            entity_id: format!("sensor.fridge_{}_humidity", name),
            body: json!({
                "state": format_value(humidity),
                "attributes": {
                    "unit_of_measurement": "%",
                    "device_class": "humidity",
                    "friendly_name": friendly("Humidity"),
                },
            }),
        });
    }
    if let Some(fridge) = &point.fridge {
        updates.push(StateUpdate {
            entity_id: format!("binary_sensor.fridge_{}_power", name),
            body: json!({
                "state": fridge,
                "attributes": { "device_class": "power", "friendly_name": friendly("Power") },
            }),
        });
    }
    if let Some(fan) = &point.fan {
        updates.push(StateUpdate {
            entity_id: format!("binary_sensor.fridge_{}_fan", name),
            body: json!({
                "state": fan,
                "attributes": { "device_class": "running", "friendly_name": friendly("Fan") },
            }),
        });
    }
    updates
}

pub struct HomeAssistantCollector {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    name: String,
}

impl HomeAssistantCollector {
    pub fn new(endpoint: &CollectorEndpoint, sensor_name: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: endpoint.base_url(),
            token: endpoint.auth_token.clone(),
            name: slugify(sensor_name),
        })
    }

    async fn post_state(&self, update: &StateUpdate) -> Result<(), PublishError> {
        let url = format!("{}/api/states/{}", self.base_url, update.entity_id);
        let mut request = self.client.post(url).json(&update.body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        match response.status().as_u16() {
            200 | 201 => Ok(()),
            code => Err(PublishError::Status(code)),
        }
    }
}

impl Collector for HomeAssistantCollector {
    async fn deliver(&mut self, points: &[DataPoint]) -> Delivery {
        let Some(latest) = points.last() else {
            return Delivery::Acknowledged(0);
        };

        let mut failed = 0;
        for update in state_updates(&self.name, latest) {
            if let Err(err) = self.post_state(&update).await {
                warn!(entity = %update.entity_id, error = %err, "state update failed");
                failed += 1;
            }
        }

        if failed == 0 {
            info!(name = %self.name, "home assistant states updated");
            Delivery::Acknowledged(points.len())
        } else {
            Delivery::Dropped
        }
    }
}
