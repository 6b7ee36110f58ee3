//! ==============================================================================
//! control.rs - the resilient control loop
//! ==============================================================================
//!
//! lifecycle:
//!
//!     INIT ──> READY ──> SAMPLE ──> ACTUATE ──> PUBLISH ──> SLEEP ─┐
//!                          ^                                       │
//!                          └───────────────────────────────────────┘
//!
//!     STOPPED is reached from any state when main.rs catches an interrupt.
//!
//! guarantees:
//!     - cycles never overlap; each step is awaited before the next starts.
//!     - a failing sensor stalls the cycle, it never ends it.
//!     - a failing collector costs one cycle's worth of time at most.
//!
//! ==============================================================================

use std::time::Duration;

use chrono::{Local, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::actuator::ActuatorController;
use crate::config::DaemonConfig;
use crate::domain::{DataPoint, Reading, RelayLabels};
use crate::publish::{Collector, Delivery, TelemetryPublisher};
use crate::retry::RetryPolicy;
use crate::sensor::SensorReader;
use crate::status::{RelayStatus, SharedStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Ready,
    Sample,
    Actuate,
    Publish,
    Sleep,
    Stopped,
}

pub struct ControlLoop<C> {
    reader: SensorReader,
    actuators: ActuatorController,
    publisher: TelemetryPublisher<C>,
    cycle: Duration,
    compensate: bool,
    off_on_shutdown: bool,
    status: Option<SharedStatus>,
    state: LoopState,
    cycles: u64,
}

/// INIT: claim the relays and force them off, retrying until the hardware answers.
pub async fn init_relays(actuators: &mut ActuatorController) {
    RetryPolicy::forever()
        .until_success("relay setup", || {
            let result = actuators.initialize();
            async move { result }
        })
        .await;
    info!("relays initialized, all off");
}

/// How long to sleep after a cycle that took `elapsed`.
pub fn sleep_for(cycle: Duration, elapsed: Duration, compensate: bool) -> Duration {
    if compensate {
        cycle.saturating_sub(elapsed)
    } else {
        cycle
    }
}

impl<C: Collector> ControlLoop<C> {
    pub fn new(
        reader: SensorReader,
        actuators: ActuatorController,
        publisher: TelemetryPublisher<C>,
        config: &DaemonConfig,
    ) -> Self {
        Self {
            reader,
            actuators,
            publisher,
            cycle: config.polling.cycle(),
            compensate: config.polling.compensate_elapsed,
            off_on_shutdown: config.actuators.off_on_shutdown,
            status: None,
            state: LoopState::Ready,
            cycles: 0,
        }
    }

    pub fn with_status(mut self, status: SharedStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// One SAMPLE -> ACTUATE -> PUBLISH pass.
    pub async fn run_cycle(&mut self) -> Delivery {
        self.state = LoopState::Sample;
        let reading = self.reader.read_until_success().await;
        info!(
            temperature = ?reading.temperature,
            humidity = ?reading.humidity,
            "reading"
        );

        self.state = LoopState::Actuate;
        let relays = match self.actuators.apply(&reading, &Local::now()) {
            Ok(labels) => labels,
            Err(err) => {
                error!(error = %err, "relay command failed");
                RelayLabels::default()
            }
        };

        self.state = LoopState::Publish;
        let delivery = self.publisher.publish(DataPoint::new(&reading, relays)).await;
        self.cycles += 1;

        self.update_status(reading, delivery).await;
        delivery
    }

    /// Cycle forever. Only returns by being dropped.
    pub async fn run(&mut self) {
        loop {
            let started = Instant::now();
            self.run_cycle().await;

            self.state = LoopState::Sleep;
            let pause = sleep_for(self.cycle, started.elapsed(), self.compensate);
            debug!(sleep_secs = pause.as_secs_f64(), "cycle done");
            tokio::time::sleep(pause).await;
        }
    }

    /// Final state after an interrupt, optionally switching the relays off.
    pub fn shutdown(&mut self) {
        let pending = self.publisher.pending();
        if !pending.is_empty() {
            warn!(unsent = pending.len(), "data points never reached the collector");
        }
        if self.off_on_shutdown {
            match self.actuators.force_off() {
                Ok(_) => info!("relays switched off"),
                Err(err) => error!(error = %err, "could not switch relays off"),
            }
        }
        self.state = LoopState::Stopped;
    }

    async fn update_status(&self, reading: Reading, delivery: Delivery) {
        let Some(status) = &self.status else {
            return;
        };
        let mut snapshot = status.write().await;
        snapshot.reading = Some(reading);
        snapshot.relays = self.actuators.states().iter().map(RelayStatus::from).collect();
        snapshot.pending = self.publisher.pending().len();
        snapshot.last_delivery = Some(delivery);
        snapshot.cycles = self.cycles;
        snapshot.last_update = Some(Utc::now());
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::tests::RecordingDriver;
    use crate::config::{ControlModeKind, ThresholdAction};
    use crate::hal::{Level, RelayDriver};
    use crate::sensor::tests::{fast_config, sample, ScriptedDriver};
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// acknowledges or retains per script, then acknowledges forever
    #[derive(Default)]
    struct ScriptedCollector {
        outcomes: VecDeque<bool>,
        seen: Vec<Vec<DataPoint>>,
    }

    impl Collector for ScriptedCollector {
        async fn deliver(&mut self, points: &[DataPoint]) -> Delivery {
            self.seen.push(points.to_vec());
            if self.outcomes.pop_front().unwrap_or(true) {
                Delivery::Acknowledged(points.len())
            } else {
                Delivery::Retained
            }
        }
    }

    fn control_loop(
        script: Vec<Result<crate::sensor::RawSample, ()>>,
        config: &DaemonConfig,
        outcomes: Vec<bool>,
    ) -> (ControlLoop<ScriptedCollector>, Arc<RecordingDriver>) {
        let relays = Arc::new(RecordingDriver::default());
        let reader = SensorReader::new(Arc::new(ScriptedDriver::new(script)), &fast_config());
        let actuators = ActuatorController::new(relays.clone(), &config.actuators);
        let collector = ScriptedCollector { outcomes: outcomes.into(), ..Default::default() };
        let publisher = TelemetryPublisher::new(collector, None);
        (ControlLoop::new(reader, actuators, publisher, config), relays)
    }

    fn heat_config(target: f32) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.actuators.mode = ControlModeKind::Threshold;
        config.actuators.target_temp = target;
        config.actuators.threshold_action = ThresholdAction::Heat;
        config
    }

    #[test]
    fn test_sleep_compensates_for_elapsed() {
        let cycle = Duration::from_secs(30);
        assert_eq!(sleep_for(cycle, Duration::from_secs(12), true), Duration::from_secs(18));
        assert_eq!(sleep_for(cycle, Duration::from_secs(45), true), Duration::ZERO);
        assert_eq!(sleep_for(cycle, Duration::from_secs(12), false), cycle);
    }

    #[tokio::test]
    async fn test_init_forces_relays_off() {
        let relays = Arc::new(RecordingDriver::default());
        let mut actuators = ActuatorController::new(relays.clone(), &DaemonConfig::default().actuators);

        init_relays(&mut actuators).await;

        assert_eq!(*relays.configured.lock().unwrap(), vec![23, 17]);
        assert_eq!(relays.levels()[&23], Level::Low);
        assert_eq!(relays.levels()[&17], Level::Low);
    }

    /// a gpio chip that cannot be opened for the first `failures` attempts
    struct LateGpio {
        failures: std::sync::Mutex<u32>,
        inner: RecordingDriver,
    }

    impl RelayDriver for LateGpio {
        fn configure_output(&self, pin: u8) -> anyhow::Result<()> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("/dev/gpiomem: permission denied");
            }
            self.inner.configure_output(pin)
        }

        fn write_gpio(&self, pin: u8, level: Level) -> anyhow::Result<()> {
            self.inner.write_gpio(pin, level)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_waits_for_gpio_to_open() {
        let relays = Arc::new(LateGpio { failures: std::sync::Mutex::new(3), inner: RecordingDriver::default() });
        let mut actuators = ActuatorController::new(relays.clone(), &DaemonConfig::default().actuators);

        init_relays(&mut actuators).await;

        assert_eq!(*relays.failures.lock().unwrap(), 0);
        assert_eq!(relays.inner.levels()[&23], Level::Low);
        assert_eq!(relays.inner.levels()[&17], Level::Low);
    }

    #[tokio::test]
    async fn test_cold_reading_turns_heating_relay_on() {
        let (mut control, relays) = control_loop(vec![sample(5.0, 45.2)], &heat_config(7.0), vec![]);
        assert_eq!(control.state(), LoopState::Ready);

        assert_eq!(control.run_cycle().await, Delivery::Acknowledged(1));

        assert_eq!(relays.levels()[&23], Level::High);
        let sent = &control.publisher.collector_ref().seen[0][0];
        assert_eq!(sent.temperature, Some(5.0));
        assert_eq!(sent.humidity, Some(45.2));
        assert_eq!(sent.fridge.as_deref(), Some("on"));
    }

    #[tokio::test]
    async fn test_warm_reading_turns_heating_relay_off() {
        let (mut control, relays) = control_loop(vec![sample(9.0, 40.0)], &heat_config(7.0), vec![]);

        control.run_cycle().await;

        assert_eq!(relays.levels()[&23], Level::Low);
        let sent = &control.publisher.collector_ref().seen[0][0];
        assert_eq!(sent.fridge.as_deref(), Some("off"));
    }

    #[tokio::test]
    async fn test_failed_sensor_reads_do_not_end_the_cycle() {
        let script = vec![Err(()), Err(()), Err(()), sample(4.0, 50.0)];
        let (mut control, _) = control_loop(script, &DaemonConfig::default(), vec![]);

        assert_eq!(control.run_cycle().await, Delivery::Acknowledged(1));
        assert_eq!(control.publisher.collector_ref().seen.len(), 1);
    }

    #[tokio::test]
    async fn test_undelivered_points_ride_along_next_cycle() {
        let (mut control, _) = control_loop(vec![sample(4.0, 50.0)], &DaemonConfig::default(), vec![false]);

        assert_eq!(control.run_cycle().await, Delivery::Retained);
        assert_eq!(control.publisher.pending().len(), 1);
        assert_eq!(control.run_cycle().await, Delivery::Acknowledged(2));
        assert!(control.publisher.pending().is_empty());
    }

    #[tokio::test]
    async fn test_status_snapshot_follows_cycles() {
        let status: SharedStatus = Arc::default();
        let (control, _) = control_loop(vec![sample(4.0, 50.0)], &DaemonConfig::default(), vec![false]);
        let mut control = control.with_status(status.clone());

        control.run_cycle().await;

        let snapshot = status.read().await;
        assert_eq!(snapshot.cycles, 1);
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.last_delivery, Some(Delivery::Retained));
        assert_eq!(snapshot.reading.and_then(|r| r.temperature), Some(4.0));
        assert_eq!(
            snapshot.relays,
            vec![
                RelayStatus { name: "fridge".to_string(), state: "on" },
                RelayStatus { name: "fan".to_string(), state: "off" },
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_switches_off_only_when_asked() {
        let mut config = heat_config(7.0);
        let (mut control, relays) = control_loop(vec![sample(5.0, 45.0)], &config, vec![]);
        control.run_cycle().await;
        control.shutdown();
        assert_eq!(control.state(), LoopState::Stopped);
        assert_eq!(relays.levels()[&23], Level::High);

        config.actuators.off_on_shutdown = true;
        let (mut control, relays) = control_loop(vec![sample(5.0, 45.0)], &config, vec![]);
        control.run_cycle().await;
        control.shutdown();
        assert_eq!(relays.levels()[&23], Level::Low);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_unsent_points_alone() {
        let (mut control, _) = control_loop(vec![sample(4.0, 50.0)], &DaemonConfig::default(), vec![false]);
        control.run_cycle().await;

        control.shutdown();
        assert_eq!(control.state(), LoopState::Stopped);
        assert!(!control.publisher.pending().is_empty());
    }
}
