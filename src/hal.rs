//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for relay output pins.
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (using `rppal`) and a development machine (using a mock).
//!
//! design philosophy:
//!     - "Compile Anywhere": The daemon should compile on Windows/Mac/Linux.
//!     - "Zero Cost": On the Pi, this compiles down to direct `rppal` calls.
//!     - "No read-back": the last commanded level is the source of truth.
//!     - "Open late": the gpio chip is opened by the first `configure_output`,
//!       so a device that is not ready at boot is retried with the relay setup.
//!
//! relationships:
//!     - used by: actuator.rs (relay commands every cycle)
//!     - uses: rppal (on feature="hardware")
//!
//! ==============================================================================

use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    High,
    Low,
}

impl Level {
    pub fn from_bool(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

pub trait RelayDriver: Send + Sync {
    /// claim `pin` as an output. called again on every setup retry.
    fn configure_output(&self, pin: u8) -> Result<()>;
    fn write_gpio(&self, pin: u8, level: Level) -> Result<()>;
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For WSL / Non-Hardware Build)
// ==============================================================================================
#[cfg(not(feature = "hardware"))]
pub struct Hal {
    levels: std::sync::Mutex<std::collections::HashMap<u8, Level>>,
}

#[cfg(not(feature = "hardware"))]
impl Hal {
    pub fn new() -> Self {
        tracing::info!("Using MOCK HAL (No hardware access)");
        Self { levels: Default::default() }
    }
}

#[cfg(not(feature = "hardware"))]
impl RelayDriver for Hal {
    fn configure_output(&self, pin: u8) -> Result<()> {
        tracing::debug!("[MOCK GPIO] Pin {} set to output", pin);
        Ok(())
    }

    fn write_gpio(&self, pin: u8, level: Level) -> Result<()> {
        let mut levels = self
            .levels
            .lock()
            .map_err(|_| anyhow::anyhow!("mock gpio state poisoned"))?;
        let previous = levels.insert(pin, level);
        tracing::debug!(
            "[MOCK GPIO] Pin {} write {:?}{}",
            pin,
            level,
            if previous == Some(level) { " (unchanged)" } else { "" }
        );
        Ok(())
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
pub struct Hal {
    gpio: std::sync::Mutex<Option<rppal::gpio::Gpio>>,
    pins: std::sync::Mutex<std::collections::HashMap<u8, rppal::gpio::OutputPin>>,
}

#[cfg(feature = "hardware")]
impl Hal {
    pub fn new() -> Self {
        tracing::info!("Using REAL HARDWARE HAL (rppal)");
        Self {
            gpio: Default::default(),
            pins: Default::default(),
        }
    }
}

#[cfg(feature = "hardware")]
impl RelayDriver for Hal {
    fn configure_output(&self, pin: u8) -> Result<()> {
        let mut gpio = self
            .gpio
            .lock()
            .map_err(|_| anyhow::anyhow!("gpio handle poisoned"))?;
        if gpio.is_none() {
            *gpio = Some(rppal::gpio::Gpio::new()?);
            tracing::info!("gpio opened");
        }
        let Some(gpio) = gpio.as_ref() else {
            anyhow::bail!("gpio not open");
        };

        let mut pins = self
            .pins
            .lock()
            .map_err(|_| anyhow::anyhow!("gpio pin table poisoned"))?;
        if !pins.contains_key(&pin) {
            let mut output = gpio.get(pin)?.into_output();
            // the relay keeps its last level when the daemon exits
            output.set_reset_on_drop(false);
            pins.insert(pin, output);
        }
        Ok(())
    }

    fn write_gpio(&self, pin: u8, level: Level) -> Result<()> {
        let mut pins = self
            .pins
            .lock()
            .map_err(|_| anyhow::anyhow!("gpio pin table poisoned"))?;
        let output = pins
            .get_mut(&pin)
            .ok_or_else(|| anyhow::anyhow!("GPIO {} was never configured as output", pin))?;
        match level {
            Level::High => output.set_high(),
            Level::Low => output.set_low(),
        }
        Ok(())
    }
}
