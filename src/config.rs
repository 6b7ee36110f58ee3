//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `fridge-monitor.toml`.
//!     loads configuration from file or falls back to defaults, then lets the
//!     environment (and a `.env` file) override the deployment-specific keys:
//!     broker host, room, Home Assistant names and token, DHT22 pin, debug.
//!
//! structure:
//!     - PollingConfig: cycle period and whether sleep compensates for work done.
//!     - SensorConfig: DHT22 pin or 1-Wire devices dir, retry tuning.
//!     - ActuatorsConfig: control strategy, setpoint, relay pins.
//!     - PublishConfig: transport choice and per-transport settings.
//!     - DiscoveryConfig: Home Assistant MQTT autodiscovery names.
//!     - LoggingConfig / StatusConfig: ambient knobs.
//!
//! ==============================================================================

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Env var naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "FRIDGE_MONITOR_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub polling: PollingConfig,
    pub sensor: SensorConfig,
    pub actuators: ActuatorsConfig,
    pub publish: PublishConfig,
    pub discovery: DiscoveryConfig,
    pub logging: LoggingConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub cycle_seconds: u64,
    /// sleep `cycle - elapsed` instead of the full cycle
    pub compensate_elapsed: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { cycle_seconds: 30, compensate_elapsed: true }
    }
}

impl PollingConfig {
    pub fn cycle(&self) -> Duration {
        Duration::from_secs(self.cycle_seconds)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Dht22,
    W1therm,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Dht22 => "dht22",
            SensorKind::W1therm => "w1therm",
        }
    }

    pub fn model(&self) -> &'static str {
        match self {
            SensorKind::Dht22 => "DHT22",
            SensorKind::W1therm => "DS18B20",
        }
    }
}

/// What to do once the driver-level retries are used up on a sample with holes.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingValuePolicy {
    /// fail the read, the loop sleeps briefly and polls again
    Retry,
    /// substitute 0 for the missing quantity and carry on
    Zero,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SensorConfig {
    pub kind: SensorKind,
    /// BCM pin of the DHT22 data line
    pub gpio_pin: u8,
    pub w1_devices_dir: PathBuf,
    /// pick a specific thermometer (e.g. "28-0316a2795bff"), first one otherwise
    pub w1_device: Option<String>,
    pub driver_attempts: u32,
    pub driver_retry_ms: u64,
    /// a DHT22 helper process still running after this long is killed
    pub read_timeout_secs: u64,
    /// pause between failed reads at loop level
    pub retry_delay_ms: u64,
    pub on_missing: MissingValuePolicy,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::Dht22,
            gpio_pin: 24,
            w1_devices_dir: PathBuf::from("/sys/bus/w1/devices"),
            w1_device: None,
            driver_attempts: 15,
            driver_retry_ms: 2000,
            read_timeout_secs: 10,
            retry_delay_ms: 200,
            on_missing: MissingValuePolicy::Retry,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlModeKind {
    DutyCycle,
    Threshold,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdAction {
    /// relay on above the setpoint
    Cool,
    /// relay on below the setpoint
    Heat,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RelayConfig {
    /// `false` leaves the relay unwired without deleting its pin
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub gpio_pin: u8,
    #[serde(default)]
    pub active_low: bool,
}

impl RelayConfig {
    pub fn on_pin(gpio_pin: u8) -> Self {
        Self { enabled: true, gpio_pin, active_low: false }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ActuatorsConfig {
    pub mode: ControlModeKind,
    pub target_temp: f32,
    pub threshold_action: ThresholdAction,
    /// force relays off when interrupted
    pub off_on_shutdown: bool,
    pub fridge: Option<RelayConfig>,
    pub fan: Option<RelayConfig>,
}

impl Default for ActuatorsConfig {
    fn default() -> Self {
        Self {
            mode: ControlModeKind::DutyCycle,
            target_temp: 7.0,
            threshold_action: ThresholdAction::Cool,
            off_on_shutdown: false,
            fridge: Some(RelayConfig::on_pin(23)),
            fan: Some(RelayConfig::on_pin(17)),
        }
    }
}

impl ActuatorsConfig {
    pub fn fridge_relay(&self) -> Option<&RelayConfig> {
        self.fridge.as_ref().filter(|relay| relay.enabled)
    }

    pub fn fan_relay(&self) -> Option<&RelayConfig> {
        self.fan.as_ref().filter(|relay| relay.enabled)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    HomeAssistant,
    Mqtt,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PublishConfig {
    pub transport: TransportKind,
    pub timeout_secs: u64,
    pub http: HttpConfig,
    pub home_assistant: HomeAssistantConfig,
    pub mqtt: MqttConfig,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Http,
            timeout_secs: 10,
            http: HttpConfig::default(),
            home_assistant: HomeAssistantConfig::default(),
            mqtt: MqttConfig::default(),
        }
    }
}

impl PublishConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    /// static collector host, skips the DNS lookup when set
    pub host: Option<String>,
    /// name looked up against `nameserver`
    pub service: Option<String>,
    pub nameserver: IpAddr,
    pub port: u16,
    pub path: String,
    /// post the whole pending buffer as one array
    pub batch: bool,
    /// evict the oldest pending points past this many, unbounded when unset
    pub max_pending: Option<usize>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: None,
            service: Some("jorg.eggs".to_string()),
            nameserver: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            port: 8003,
            path: "/api/dht22/".to_string(),
            batch: true,
            max_pending: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HomeAssistantConfig {
    pub host: Option<String>,
    pub service: Option<String>,
    pub nameserver: IpAddr,
    pub port: u16,
    pub token: Option<String>,
    /// entity suffix, e.g. "garage" -> sensor.fridge_garage_temperature
    pub sensor_name: Option<String>,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            host: None,
            service: None,
            nameserver: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            port: 8123,
            token: None,
            sensor_name: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConfig {
    pub host: Option<String>,
    pub port: u16,
    pub topic_room: Option<String>,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 1883,
            topic_room: None,
            client_id: "fridge-monitor".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// friendly name shown in Home Assistant
    pub sensor_name: Option<String>,
    /// groups the sensors against a device
    pub device: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let config: DaemonConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// First config file that exists, in priority order.
    pub fn locate() -> Option<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("config").join("fridge-monitor.toml"));
        paths.push(PathBuf::from("..").join("config").join("fridge-monitor.toml"));

        paths.into_iter().find(|path| path.exists())
    }

    /// Load the located file, or defaults when there is none.
    /// A file that exists but does not parse is an error.
    pub fn load_or_default() -> anyhow::Result<(Self, Option<PathBuf>)> {
        match Self::locate() {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    /// Environment overrides. Blank values count as unset.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            var(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(host) = var("MQTT_HOST") {
            self.publish.mqtt.host = Some(host);
        }
        if let Some(room) = var("MQTT_TOPIC_ROOM") {
            self.publish.mqtt.topic_room = Some(room);
        }
        if let Some(name) = var("HA_SENSOR_NAME") {
            self.discovery.sensor_name = Some(name.clone());
            if self.publish.home_assistant.sensor_name.is_none() {
                self.publish.home_assistant.sensor_name = Some(name);
            }
        }
        if let Some(device) = var("HA_DEVICE") {
            self.discovery.device = Some(device);
        }
        if let Some(token) = var("HA_TOKEN") {
            self.publish.home_assistant.token = Some(token);
        }
        if let Some(pin) = var("GPIO_PIN_DHT22") {
            match pin.parse() {
                Ok(pin) => self.sensor.gpio_pin = pin,
                Err(_) => tracing::warn!(value = %pin, "ignoring non-numeric GPIO_PIN_DHT22"),
            }
        }
        if var("DEBUG").is_some() {
            self.logging.level = "debug".to_string();
        }
    }

    /// Check required settings and fill in derived ones.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.polling.cycle_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "polling.cycle_seconds",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sensor.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "sensor.read_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.actuators.mode == ControlModeKind::Threshold && !self.actuators.target_temp.is_finite() {
            return Err(ConfigError::Invalid {
                key: "actuators.target_temp",
                reason: "must be a finite number".to_string(),
            });
        }

        match self.publish.transport {
            TransportKind::Http => {
                let http = &self.publish.http;
                if http.host.is_none() && http.service.is_none() {
                    return Err(ConfigError::MissingEither("publish.http.host", "publish.http.service"));
                }
                if http.max_pending == Some(0) {
                    return Err(ConfigError::Invalid {
                        key: "publish.http.max_pending",
                        reason: "must be at least 1".to_string(),
                    });
                }
            }
            TransportKind::HomeAssistant => {
                let ha = &self.publish.home_assistant;
                if ha.host.is_none() && ha.service.is_none() {
                    return Err(ConfigError::MissingEither(
                        "publish.home_assistant.host",
                        "publish.home_assistant.service",
                    ));
                }
                if ha.token.is_none() {
                    return Err(ConfigError::Missing("HA_TOKEN"));
                }
                if ha.sensor_name.is_none() {
                    return Err(ConfigError::Missing("HA_SENSOR_NAME"));
                }
            }
            TransportKind::Mqtt => {
                if self.publish.mqtt.host.is_none() {
                    return Err(ConfigError::Missing("MQTT_HOST"));
                }
                if self.publish.mqtt.topic_room.is_none() {
                    match &self.discovery.sensor_name {
                        Some(name) => {
                            let room = slugify(name);
                            tracing::info!(
                                room = %room,
                                sensor_name = %name,
                                "MQTT_TOPIC_ROOM derived from HA_SENSOR_NAME"
                            );
                            self.publish.mqtt.topic_room = Some(room);
                        }
                        None => return Err(ConfigError::MissingEither("MQTT_TOPIC_ROOM", "HA_SENSOR_NAME")),
                    }
                }
                if self.discovery.sensor_name.is_some() && self.discovery.device.is_none() {
                    return Err(ConfigError::Missing("HA_DEVICE"));
                }
            }
        }

        Ok(())
    }

    /// Log configuration summary
    pub fn print_summary(&self) {
        tracing::info!(
            sensor = self.sensor.kind.as_str(),
            gpio_pin = self.sensor.gpio_pin,
            mode = ?self.actuators.mode,
            target_temp = self.actuators.target_temp,
            fridge_pin = ?self.actuators.fridge_relay().map(|r| r.gpio_pin),
            fan_pin = ?self.actuators.fan_relay().map(|r| r.gpio_pin),
            transport = ?self.publish.transport,
            cycle_seconds = self.polling.cycle_seconds,
            log_level = %self.logging.level,
            "configuration"
        );
    }
}

/// "Garage Fridge" -> "garage_fridge"
pub fn slugify(name: &str) -> String {
    name.replace(' ', "_").to_lowercase()
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_validate_for_http() {
        let mut config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.publish.http.port, 8003);
        assert_eq!(config.sensor.gpio_pin, 24);
        assert_eq!(config.sensor.read_timeout_secs, 10);
    }

    #[test]
    fn test_zero_read_timeout_is_rejected() {
        let mut config = DaemonConfig::default();
        config.sensor.read_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "sensor.read_timeout_secs", .. })
        ));
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[polling]
cycle_seconds = 60

[sensor]
kind = "w1therm"
on_missing = "zero"

[actuators]
mode = "threshold"
target_temp = 4.5

[actuators.fridge]
gpio_pin = 5
active_low = true

[actuators.fan]
enabled = false
gpio_pin = 17

[publish]
transport = "mqtt"

[publish.mqtt]
host = "broker.lan"
topic_room = "cellar"
"#
        )
        .unwrap();

        let mut config = DaemonConfig::load(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.polling.cycle_seconds, 60);
        assert_eq!(config.sensor.kind, SensorKind::W1therm);
        assert_eq!(config.sensor.on_missing, MissingValuePolicy::Zero);
        assert_eq!(config.actuators.mode, ControlModeKind::Threshold);
        assert_eq!(
            config.actuators.fridge_relay(),
            Some(&RelayConfig { enabled: true, gpio_pin: 5, active_low: true })
        );
        assert_eq!(config.actuators.fan_relay(), None);
        // keys not mentioned keep their defaults
        assert_eq!(config.actuators.target_temp, 4.5);
        assert_eq!(config.sensor.retry_delay_ms, 200);
        assert_eq!(config.publish.mqtt.port, 1883);
    }

    #[test]
    fn test_shipped_sample_parses() {
        let mut config: DaemonConfig = toml::from_str(include_str!("../config/fridge-monitor.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.publish.http.service.as_deref(), Some("jorg.eggs"));
        assert_eq!(config.status.bind, SocketAddr::from(([0, 0, 0, 0], 3000)));
    }

    #[test]
    fn test_mqtt_requires_host() {
        let mut config = DaemonConfig::default();
        config.publish.transport = TransportKind::Mqtt;
        config.apply_env(env(&[("MQTT_TOPIC_ROOM", "kitchen")]));

        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "You must set MQTT_HOST");
    }

    #[test]
    fn test_topic_room_derived_from_sensor_name() {
        let mut config = DaemonConfig::default();
        config.publish.transport = TransportKind::Mqtt;
        config.apply_env(env(&[
            ("MQTT_HOST", "broker"),
            ("HA_SENSOR_NAME", "Beer Fridge"),
            ("HA_DEVICE", "pi3"),
        ]));

        config.validate().unwrap();
        assert_eq!(config.publish.mqtt.topic_room.as_deref(), Some("beer_fridge"));
    }

    #[test]
    fn test_mqtt_without_room_or_name_fails() {
        let mut config = DaemonConfig::default();
        config.publish.transport = TransportKind::Mqtt;
        config.apply_env(env(&[("MQTT_HOST", "broker")]));

        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingEither("MQTT_TOPIC_ROOM", "HA_SENSOR_NAME"))
        ));
    }

    #[test]
    fn test_discovery_requires_device() {
        let mut config = DaemonConfig::default();
        config.publish.transport = TransportKind::Mqtt;
        config.apply_env(env(&[("MQTT_HOST", "broker"), ("HA_SENSOR_NAME", "Cellar")]));

        assert!(matches!(config.validate(), Err(ConfigError::Missing("HA_DEVICE"))));
    }

    #[test]
    fn test_home_assistant_requires_token() {
        let mut config = DaemonConfig::default();
        config.publish.transport = TransportKind::HomeAssistant;
        config.publish.home_assistant.host = Some("hass.lan".to_string());
        config.apply_env(env(&[("HA_SENSOR_NAME", "garage")]));

        assert!(matches!(config.validate(), Err(ConfigError::Missing("HA_TOKEN"))));

        config.apply_env(env(&[("HA_TOKEN", "abc")]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = DaemonConfig::default();
        config.apply_env(env(&[("GPIO_PIN_DHT22", "4"), ("DEBUG", "1")]));
        assert_eq!(config.sensor.gpio_pin, 4);
        assert_eq!(config.logging.level, "debug");

        config.apply_env(env(&[("GPIO_PIN_DHT22", "four")]));
        assert_eq!(config.sensor.gpio_pin, 4);
    }
}
