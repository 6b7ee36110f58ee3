//! ==============================================================================
//! main.rs - fridge monitor daemon entry point
//! ==============================================================================
//!
//! purpose:
//!     polls one fridge sensor (DHT22 or 1-Wire DS18B20), drives the fridge and
//!     fan relays from the reading, and ships telemetry to a collector. runs
//!     until interrupted.
//!
//! responsibilities:
//!     - load configuration (toml file, .env, process environment)
//!     - set up logging
//!     - INIT: force relays off, locate and connect the collector
//!     - run the control loop, optionally serve the status endpoint
//!     - stop cleanly on ctrl-c / SIGTERM
//!
//! relationships:
//!     - uses: config.rs, control.rs, publish/, sensor.rs, actuator.rs, hal.rs
//!     - optional: status.rs (local json view on port 3000)
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                    fridge-monitor (this file)                │
//!     │  ┌──────────────┐   ┌────────────────┐   ┌───────────────┐   │
//!     │  │ control loop │──>│ status (opt.)  │   │ mqtt driver   │   │
//!     │  │ (30s cycle)  │   │ (port 3000)    │   │ (mqtt only)   │   │
//!     │  └──┬──────┬────┘   └────────────────┘   └───────┬───────┘   │
//!     │     │      │                                     │           │
//!     └─────┼──────┼─────────────────────────────────────┼───────────┘
//!           │      │                                     │
//!           ▼      ▼                                     ▼
//!     ┌─────────┐ ┌─────────────┐              ┌──────────────────┐
//!     │ sensor  │ │ relays      │              │ collector        │
//!     │ (gpio / │ │ (gpio 23,   │              │ (http / ha / mqtt)│
//!     │  w1)    │ │  gpio 17)   │              └──────────────────┘
//!     └─────────┘ └─────────────┘
//!
//! exit codes:
//!     0 - interrupted
//!     1 - configuration missing or invalid
//!
//! ==============================================================================

mod actuator;
mod config;
mod control;
mod domain;
mod error;
mod hal;
mod locator;
mod publish;
mod retry;
mod sensor;
mod status;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::ActuatorController;
use config::DaemonConfig;
use control::ControlLoop;
use hal::{Hal, RelayDriver};
use publish::TelemetryPublisher;
use sensor::SensorReader;
use status::SharedStatus;

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: configuration file and .env
    dotenvy::dotenv().ok();
    let (mut config, source) = match DaemonConfig::load_or_default() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("[ERROR] {:#}", e);
            std::process::exit(1);
        }
    };

    // step 2: logging, then environment overrides and validation
    init_tracing(&config.logging.level);
    match &source {
        Some(path) => info!(path = %path.display(), "config loaded"),
        None => warn!("no config file found, using defaults"),
    }
    config.apply_env(|key| std::env::var(key).ok());
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }
    config.print_summary();

    // step 3: hardware (the gpio chip itself is opened during INIT)
    let relays: Arc<dyn RelayDriver> = Arc::new(Hal::new());
    let mut actuators = ActuatorController::new(relays, &config.actuators);
    let reader = SensorReader::new(sensor::driver_for(&config.sensor), &config.sensor);

    // step 4: INIT, interruptible since both halves may retry forever
    let startup = async {
        control::init_relays(&mut actuators).await;
        publish::connect(&config).await
    };
    let collector = tokio::select! {
        collector = startup => collector?,
        _ = shutdown_signal() => {
            info!("interrupted during startup");
            return Ok(());
        }
    };
    let publisher = TelemetryPublisher::new(collector, publish::buffer_cap(&config));
    let mut control = ControlLoop::new(reader, actuators, publisher, &config);

    // step 5: optional status endpoint
    if config.status.enabled {
        let state = SharedStatus::default();
        control = control.with_status(state.clone());
        let bind = config.status.bind;
        tokio::spawn(async move {
            if let Err(e) = status::run_server(state, bind).await {
                error!(error = %e, "status server stopped");
            }
        });
    }

    // step 6: run until interrupted
    info!(cycle_seconds = config.polling.cycle_seconds, "starting control loop");
    tokio::select! {
        _ = control.run() => {}
        _ = shutdown_signal() => {
            info!("interrupt received, stopping");
        }
    }
    control.shutdown();
    info!(state = ?control.state(), "fin");
    Ok(())
}

/// `RUST_LOG` wins, then `DEBUG`, then the configured level.
fn init_tracing(level: &str) {
    let debug = std::env::var("DEBUG").is_ok_and(|value| !value.trim().is_empty());
    let fallback = if debug { "debug" } else { level };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .init();
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
