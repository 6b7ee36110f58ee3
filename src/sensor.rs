//! ==============================================================================
//! sensor.rs - sensor drivers and the reader that tames them
//! ==============================================================================
//!
//! purpose:
//!     turns one flaky physical sensor into a stream of `Reading`s.
//!     the drivers only know how to do a single blocking read; `SensorReader`
//!     owns the retry rules around them.
//!
//! retry layers:
//!     - driver level: a bounded number of attempts at a fixed interval
//!       (15 x 2s by default, the Adafruit `read_retry` defaults).
//!     - loop level: if a whole read fails, sleep ~200ms and read again.
//!       the loop never moves on with missing data.
//!
//! why subprocess to python for the DHT22?:
//!     dht22 sensors require precise bit-banging timing (~microseconds).
//!     pure rust in userspace is unreliable due to lack of real-time guarantees.
//!     adafruit_dht handles this correctly with timing compensation.
//!     the helper process gets a deadline and is killed when it overruns,
//!     so a wedged read fails like any other and the retry layers take over.
//!
//! ==============================================================================

use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use tracing::{debug, error};

use crate::config::{MissingValuePolicy, SensorConfig, SensorKind};
use crate::domain::Reading;
use crate::error::SensorError;
use crate::retry::RetryPolicy;

/// what a driver returned for one read, holes included
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
}

pub trait SensorDriver: Send + Sync {
    /// one blocking read, no retries
    fn read(&self) -> Result<RawSample, SensorError>;

    /// whether a missing humidity is a failure for this driver
    fn measures_humidity(&self) -> bool {
        true
    }
}

// ==============================================================================
// dht22 via adafruit_dht
// ==============================================================================

pub struct Dht22Driver {
    pin: u8,
    deadline: Duration,
}

impl Dht22Driver {
    pub fn new(pin: u8, deadline: Duration) -> Self {
        Self { pin, deadline }
    }
}

impl SensorDriver for Dht22Driver {
    fn read(&self) -> Result<RawSample, SensorError> {
        // Python one-liner to read DHT22 and output JSON
        let script = format!(
            r#"
import sys
try:
    import adafruit_dht
    import board
    import json

    # create dht22 sensor on specified pin
    dht = adafruit_dht.DHT22(board.D{})

    try:
        print(json.dumps({{"t": dht.temperature, "h": dht.humidity}}))
    finally:
        dht.exit()
except RuntimeError:
    # checksum/timing glitches are routine for this sensor
    print("null")
except Exception as e:
    # Print ONLY the error message to stderr (no traceback with paths)
    print(str(e), file=sys.stderr)
    sys.exit(1)
"#,
            self.pin
        );

        let mut command = Command::new("python3");
        command.arg("-c").arg(&script);
        let output = run_blocking(command, self.deadline)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SensorError::Driver(format!("python error: {}", stderr.trim())));
        }

        parse_dht22_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Run `command` to completion from a blocking thread, see `output_within`.
fn run_blocking(command: Command, deadline: Duration) -> Result<Output, SensorError> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| SensorError::Driver(format!("no runtime for the driver process: {}", e)))?;
    runtime.block_on(output_within(command, deadline))
}

/// Collect the output of `command`, killing it if it is still running at `deadline`.
async fn output_within(mut command: Command, deadline: Duration) -> Result<Output, SensorError> {
    command.kill_on_drop(true);
    match tokio::time::timeout(deadline, command.output()).await {
        Ok(output) => output.map_err(|e| SensorError::Driver(format!("failed to run driver process: {}", e))),
        Err(_) => Err(SensorError::Timeout(deadline)),
    }
}

fn parse_dht22_output(stdout: &str) -> Result<RawSample, SensorError> {
    let stdout = stdout.trim();
    if stdout == "null" || stdout.is_empty() {
        return Ok(RawSample { temperature: None, humidity: None });
    }

    let parsed: serde_json::Value = serde_json::from_str(stdout)
        .map_err(|e| SensorError::Driver(format!("JSON parse error: {} (got: {})", e, stdout)))?;

    Ok(RawSample {
        temperature: parsed["t"].as_f64().map(|t| t as f32),
        humidity: parsed["h"].as_f64().map(|h| h as f32),
    })
}

// ==============================================================================
// ds18b20 via the w1 sysfs tree
// ==============================================================================

/// Family code of DS18B20 thermometers in w1 device names.
const DS18B20_PREFIX: &str = "28-";

/// Scratchpad content after power-on, before any conversion.
const DS18B20_RESET_MILLIS: i32 = 85_000;

pub struct W1ThermDriver {
    devices_dir: PathBuf,
    device: Option<String>,
}

impl W1ThermDriver {
    pub fn new(devices_dir: impl Into<PathBuf>, device: Option<String>) -> Self {
        Self { devices_dir: devices_dir.into(), device }
    }

    fn slave_file(&self) -> Result<PathBuf, SensorError> {
        if let Some(device) = &self.device {
            return Ok(self.devices_dir.join(device).join("w1_slave"));
        }
        let no_device = || SensorError::NoDevice(self.devices_dir.display().to_string());
        let mut names: Vec<String> = std::fs::read_dir(&self.devices_dir)
            .map_err(|_| no_device())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(DS18B20_PREFIX))
            .collect();
        names.sort();
        let first = names.into_iter().next().ok_or_else(no_device)?;
        Ok(self.devices_dir.join(first).join("w1_slave"))
    }
}

impl SensorDriver for W1ThermDriver {
    fn read(&self) -> Result<RawSample, SensorError> {
        let path = self.slave_file()?;
        let content = std::fs::read_to_string(&path)
            .map_err(|e| SensorError::Driver(format!("{}: {}", path.display(), e)))?;
        let celsius = parse_w1_slave(&content)?;
        Ok(RawSample { temperature: Some(celsius), humidity: None })
    }

    fn measures_humidity(&self) -> bool {
        false
    }
}

/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
fn parse_w1_slave(content: &str) -> Result<f32, SensorError> {
    let mut lines = content.lines();
    let crc_line = lines.next().unwrap_or_default();
    if !crc_line.trim_end().ends_with("YES") {
        return Err(SensorError::Crc);
    }
    let raw = lines
        .next()
        .and_then(|line| line.split("t=").nth(1))
        .ok_or_else(|| SensorError::Driver("w1_slave has no t= field".to_string()))?;
    let millis: i32 = raw
        .trim()
        .parse()
        .map_err(|_| SensorError::Driver(format!("bad w1 temperature {:?}", raw.trim())))?;
    if millis == DS18B20_RESET_MILLIS {
        return Err(SensorError::ResetValue);
    }
    Ok(millis as f32 / 1000.0)
}

pub fn driver_for(config: &SensorConfig) -> Arc<dyn SensorDriver> {
    match config.kind {
        SensorKind::Dht22 => Arc::new(Dht22Driver::new(
            config.gpio_pin,
            Duration::from_secs(config.read_timeout_secs),
        )),
        SensorKind::W1therm => Arc::new(W1ThermDriver::new(
            config.w1_devices_dir.clone(),
            config.w1_device.clone(),
        )),
    }
}

// ==============================================================================
// reader
// ==============================================================================

pub struct SensorReader {
    driver: Arc<dyn SensorDriver>,
    driver_retry: RetryPolicy,
    retry_delay: Duration,
    on_missing: MissingValuePolicy,
}

impl SensorReader {
    pub fn new(driver: Arc<dyn SensorDriver>, config: &SensorConfig) -> Self {
        Self {
            driver,
            driver_retry: RetryPolicy::fixed(
                Duration::from_millis(config.driver_retry_ms),
                config.driver_attempts,
            ),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            on_missing: config.on_missing,
        }
    }

    /// Poll until a reading comes back. Never fails, never gives up.
    pub async fn read_until_success(&self) -> Reading {
        loop {
            match self.read_once().await {
                Ok(reading) => return reading,
                Err(err) => {
                    error!(error = %err, "sensor read failed");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// One read including the driver-level retries.
    pub async fn read_once(&self) -> Result<Reading, SensorError> {
        let wants_humidity = self.driver.measures_humidity();
        let result = self
            .driver_retry
            .bounded("sensor read", || {
                let driver = Arc::clone(&self.driver);
                async move {
                    // offload blocking io to dedicated thread
                    let sample = tokio::task::spawn_blocking(move || driver.read())
                        .await
                        .map_err(|e| SensorError::Join(e.to_string()))??;
                    if sample.temperature.is_none() || (wants_humidity && sample.humidity.is_none()) {
                        return Err(SensorError::Incomplete {
                            temperature: sample.temperature,
                            humidity: sample.humidity,
                        });
                    }
                    Ok::<_, SensorError>(sample)
                }
            })
            .await;

        match result {
            Ok(sample) => {
                debug!(temperature = ?sample.temperature, humidity = ?sample.humidity, "sensor sample");
                Ok(Reading::new(sample.temperature, sample.humidity))
            }
            Err(SensorError::Incomplete { temperature, humidity })
                if self.on_missing == MissingValuePolicy::Zero =>
            {
                if humidity.is_none() && wants_humidity {
                    error!("Humidity reporting null");
                }
                if temperature.is_none() {
                    error!("Temp reporting null");
                }
                let humidity = if wants_humidity { Some(humidity.unwrap_or(0.0)) } else { None };
                Ok(Reading::new(Some(temperature.unwrap_or(0.0)), humidity))
            }
            Err(err) => Err(err),
        }
    }
}
