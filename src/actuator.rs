//! ==============================================================================
//! actuator.rs - fridge and fan relay decisions
//! ==============================================================================
//!
//! strategies:
//!     - duty cycle: the fridge flips on every call (first call on), the fan is
//!       driven to the opposite phase. no sensor input involved.
//!     - threshold: fridge on iff the temperature is strictly past the setpoint,
//!       no dead band. fan on during even wall-clock minutes.
//!
//! every call re-asserts both outputs, even when nothing changed.
//!
//! ==============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Timelike};
use tracing::debug;

use crate::config::{ActuatorsConfig, ControlModeKind, RelayConfig, ThresholdAction};
use crate::domain::{on_off, ActuatorState, Reading, RelayLabels};
use crate::hal::{Level, RelayDriver};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlMode {
    DutyCycle,
    Threshold { target: f32, action: ThresholdAction },
}

impl ControlMode {
    pub fn from_config(config: &ActuatorsConfig) -> Self {
        match config.mode {
            ControlModeKind::DutyCycle => ControlMode::DutyCycle,
            ControlModeKind::Threshold => ControlMode::Threshold {
                target: config.target_temp,
                action: config.threshold_action,
            },
        }
    }
}

/// Fridge command for threshold mode. Equality is always off.
pub fn fridge_command(temperature: Option<f32>, target: f32, action: ThresholdAction) -> bool {
    match (temperature, action) {
        (Some(t), ThresholdAction::Cool) => t > target,
        (Some(t), ThresholdAction::Heat) => t < target,
        (None, _) => false,
    }
}

/// Fan command for threshold mode: on during even minutes.
pub fn fan_command<Tz: TimeZone>(now: &DateTime<Tz>) -> bool {
    now.minute() % 2 == 0
}

pub struct Relay {
    pin: u8,
    active_low: bool,
    state: ActuatorState,
}

impl Relay {
    pub fn new(name: &str, config: &RelayConfig) -> Self {
        Self {
            pin: config.gpio_pin,
            active_low: config.active_low,
            state: ActuatorState { name: name.to_string(), is_on: false },
        }
    }

    pub fn state(&self) -> &ActuatorState {
        &self.state
    }

    fn command(&mut self, driver: &dyn RelayDriver, on: bool) -> Result<()> {
        let level = Level::from_bool(on != self.active_low);
        driver.write_gpio(self.pin, level)?;
        debug!("{} switched {} (pin {:?})", self.state.name, on_off(on), level);
        self.state.is_on = on;
        Ok(())
    }
}

pub struct ActuatorController {
    driver: Arc<dyn RelayDriver>,
    mode: ControlMode,
    fridge: Option<Relay>,
    fan: Option<Relay>,
    /// duty-cycle phase, flipped on every call
    duty_on: bool,
}

impl ActuatorController {
    pub fn new(driver: Arc<dyn RelayDriver>, config: &ActuatorsConfig) -> Self {
        Self {
            driver,
            mode: ControlMode::from_config(config),
            fridge: config.fridge_relay().map(|relay| Relay::new("fridge", relay)),
            fan: config.fan_relay().map(|relay| Relay::new("fan", relay)),
            duty_on: false,
        }
    }

    pub fn states(&self) -> Vec<ActuatorState> {
        self.fridge
            .iter()
            .chain(self.fan.iter())
            .map(|relay| relay.state().clone())
            .collect()
    }

    /// Claim the output pins and force every relay off.
    pub fn initialize(&mut self) -> Result<()> {
        for relay in self.fridge.iter().chain(self.fan.iter()) {
            self.driver.configure_output(relay.pin)?;
        }
        self.force_off()?;
        Ok(())
    }

    /// Decide and command both relays for this cycle.
    pub fn apply<Tz: TimeZone>(&mut self, reading: &Reading, now: &DateTime<Tz>) -> Result<RelayLabels> {
        let (fridge_on, fan_on) = match self.mode {
            ControlMode::DutyCycle => {
                self.duty_on = !self.duty_on;
                (self.duty_on, !self.duty_on)
            }
            ControlMode::Threshold { target, action } => {
                (fridge_command(reading.temperature, target, action), fan_command(now))
            }
        };
        self.command(fridge_on, fan_on)
    }

    /// Same commands as a cycle, both off.
    pub fn force_off(&mut self) -> Result<RelayLabels> {
        self.duty_on = false;
        self.command(false, false)
    }

    fn command(&mut self, fridge_on: bool, fan_on: bool) -> Result<RelayLabels> {
        let mut labels = RelayLabels::default();
        if let Some(fridge) = self.fridge.as_mut() {
            fridge.command(self.driver.as_ref(), fridge_on)?;
            labels.fridge = Some(fridge_on);
        }
        if let Some(fan) = self.fan.as_mut() {
            fan.command(self.driver.as_ref(), fan_on)?;
            labels.fan = Some(fan_on);
        }
        Ok(labels)
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// remembers every write per pin
    #[derive(Default)]
    pub(crate) struct RecordingDriver {
        pub(crate) writes: Mutex<Vec<(u8, Level)>>,
        pub(crate) configured: Mutex<Vec<u8>>,
    }

    impl RecordingDriver {
        pub(crate) fn levels(&self) -> HashMap<u8, Level> {
            self.writes.lock().unwrap().iter().copied().collect()
        }
    }

    impl RelayDriver for RecordingDriver {
        fn configure_output(&self, pin: u8) -> Result<()> {
            self.configured.lock().unwrap().push(pin);
            Ok(())
        }

        fn write_gpio(&self, pin: u8, level: Level) -> Result<()> {
            self.writes.lock().unwrap().push((pin, level));
            Ok(())
        }
    }

    fn threshold_config(target: f32) -> ActuatorsConfig {
        ActuatorsConfig { mode: ControlModeKind::Threshold, target_temp: target, ..ActuatorsConfig::default() }
    }

    fn reading(temperature: f32) -> Reading {
        Reading::new(Some(temperature), Some(45.2))
    }

    fn at_minute(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 30).unwrap()
    }

    #[test]
    fn test_threshold_is_strict() {
        for t in [-20.0, 0.0, 6.9, 7.0] {
            assert!(!fridge_command(Some(t), 7.0, ThresholdAction::Cool), "t={t}");
        }
        for t in [7.01, 9.0, 40.0] {
            assert!(fridge_command(Some(t), 7.0, ThresholdAction::Cool), "t={t}");
        }
        assert!(!fridge_command(None, 7.0, ThresholdAction::Cool));

        assert!(fridge_command(Some(5.0), 7.0, ThresholdAction::Heat));
        assert!(!fridge_command(Some(7.0), 7.0, ThresholdAction::Heat));
        assert!(!fridge_command(Some(9.0), 7.0, ThresholdAction::Heat));
    }

    #[test]
    fn test_fan_follows_even_minutes() {
        for minute in 0..60 {
            assert_eq!(fan_command(&at_minute(minute)), minute % 2 == 0);
        }
    }

    #[test]
    fn test_threshold_mode_commands_pins() {
        let driver = Arc::new(RecordingDriver::default());
        let mut controller = ActuatorController::new(driver.clone(), &threshold_config(7.0));

        let labels = controller.apply(&reading(9.0), &at_minute(4)).unwrap();
        assert_eq!(labels, RelayLabels { fridge: Some(true), fan: Some(true) });
        assert_eq!(driver.levels()[&23], Level::High);
        assert_eq!(driver.levels()[&17], Level::High);

        let labels = controller.apply(&reading(5.0), &at_minute(5)).unwrap();
        assert_eq!(labels, RelayLabels { fridge: Some(false), fan: Some(false) });
        assert_eq!(driver.levels()[&23], Level::Low);
        assert_eq!(driver.levels()[&17], Level::Low);
    }

    #[test]
    fn test_heat_action_matches_setpoint_scenarios() {
        let config = ActuatorsConfig { threshold_action: ThresholdAction::Heat, ..threshold_config(7.0) };
        let mut controller = ActuatorController::new(Arc::new(RecordingDriver::default()), &config);

        assert_eq!(controller.apply(&reading(5.0), &at_minute(1)).unwrap().fridge, Some(true));
        assert_eq!(controller.apply(&reading(9.0), &at_minute(1)).unwrap().fridge, Some(false));
    }

    #[test]
    fn test_duty_cycle_alternates_with_opposite_fan() {
        let driver = Arc::new(RecordingDriver::default());
        let mut controller = ActuatorController::new(driver.clone(), &ActuatorsConfig::default());

        let phases: Vec<RelayLabels> = (0..4)
            .map(|_| controller.apply(&reading(30.0), &at_minute(0)).unwrap())
            .collect();

        let on = RelayLabels { fridge: Some(true), fan: Some(false) };
        let off = RelayLabels { fridge: Some(false), fan: Some(true) };
        assert_eq!(phases, vec![on, off, on, off]);
    }

    #[test]
    fn test_repeated_level_is_reasserted_not_suppressed() {
        let driver = Arc::new(RecordingDriver::default());
        let mut controller = ActuatorController::new(driver.clone(), &threshold_config(7.0));

        controller.apply(&reading(9.0), &at_minute(2)).unwrap();
        let once = driver.levels();
        controller.apply(&reading(9.0), &at_minute(2)).unwrap();

        assert_eq!(driver.levels(), once);
        assert_eq!(driver.writes.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_initialize_forces_off_and_respects_active_low() {
        let config = ActuatorsConfig {
            fridge: Some(RelayConfig { enabled: true, gpio_pin: 5, active_low: true }),
            fan: None,
            ..ActuatorsConfig::default()
        };
        let driver = Arc::new(RecordingDriver::default());
        let mut controller = ActuatorController::new(driver.clone(), &config);

        controller.initialize().unwrap();
        assert_eq!(*driver.configured.lock().unwrap(), vec![5]);
        // active-low: off means the pin is held high
        assert_eq!(driver.levels()[&5], Level::High);
        assert_eq!(
            controller.states(),
            vec![ActuatorState { name: "fridge".to_string(), is_on: false }]
        );

        let labels = controller.apply(&reading(0.0), &at_minute(0)).unwrap();
        assert_eq!(labels, RelayLabels { fridge: Some(true), fan: None });
        assert_eq!(driver.levels()[&5], Level::Low);
    }
}
