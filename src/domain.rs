use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// one successful sensor poll
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    /// temperature in celsius
    pub temperature: Option<f32>,
    /// relative humidity (0-100%), absent for 1-wire thermometers
    pub humidity: Option<f32>,
}

impl Reading {
    pub fn new(temperature: Option<f32>, humidity: Option<f32>) -> Self {
        Self {
            timestamp: Utc::now(),
            temperature,
            humidity,
        }
    }
}

/// logical state of one relay, mirrors the last commanded level
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActuatorState {
    pub name: String,
    pub is_on: bool,
}

impl ActuatorState {
    pub fn label(&self) -> &'static str {
        on_off(self.is_on)
    }
}

pub fn on_off(is_on: bool) -> &'static str {
    if is_on {
        "on"
    } else {
        "off"
    }
}

/// relay labels produced by one actuation, `None` when the relay is not wired
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RelayLabels {
    pub fridge: Option<bool>,
    pub fan: Option<bool>,
}

/// telemetry wire form of a reading
///
/// examples:
/// - {"ts": "1700000000", "temperature": 5.0, "humidity": 45.2}
/// - {"ts": "1700000030", "temperature": 5.1, "humidity": 45.0, "fridge": "on", "fan": "off"}
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// epoch seconds, fractional part dropped
    pub ts: String,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fridge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan: Option<String>,
}

impl DataPoint {
    pub fn new(reading: &Reading, relays: RelayLabels) -> Self {
        Self {
            ts: reading.timestamp.timestamp().to_string(),
            temperature: reading.temperature,
            humidity: reading.humidity,
            fridge: relays.fridge.map(|on| on_off(on).to_string()),
            fan: relays.fan.map(|on| on_off(on).to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    HomeAssistant,
    Mqtt,
}

/// where telemetry goes, resolved once at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectorEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub auth_token: Option<String>,
}

impl CollectorEndpoint {
    pub fn base_url(&self) -> String {
        let scheme = match self.protocol {
            Protocol::Http | Protocol::HomeAssistant => "http",
            Protocol::Mqtt => "mqtt",
        };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}
