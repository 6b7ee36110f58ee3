//! ==============================================================================
//! error.rs - failure kinds the daemon distinguishes
//! ==============================================================================
//!
//! sensor and network failures are transient: they are absorbed by the component
//! that owns the resource and never escape the control loop. configuration errors
//! are the only fatal kind and surface once, at startup.
//!
//! ==============================================================================

use std::time::Duration;

use thiserror::Error;

/// A single sensor poll did not yield a usable value.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor driver failed: {0}")]
    Driver(String),

    /// the driver answered but left one or both quantities empty
    #[error("incomplete sample (temperature: {temperature:?}, humidity: {humidity:?})")]
    Incomplete {
        temperature: Option<f32>,
        humidity: Option<f32>,
    },

    #[error("no 1-wire thermometer found under {0}")]
    NoDevice(String),

    #[error("1-wire CRC check failed")]
    Crc,

    /// 85 °C with a good CRC: the DS18B20 never finished a conversion
    #[error("DS18B20 reported its power-on value (85 °C)")]
    ResetValue,

    #[error("sensor driver gave no answer within {0:?}")]
    Timeout(Duration),

    #[error("blocking read task failed: {0}")]
    Join(String),
}

/// Required setting absent or contradictory. Fatal at startup (exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("You must set {0}")]
    Missing(&'static str),

    #[error("You must set {0} or {1}")]
    MissingEither(&'static str, &'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// One delivery attempt to the collector failed.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("collector answered HTTP {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("mqtt client rejected publish: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}
