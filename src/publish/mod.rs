//! ==============================================================================
//! publish - telemetry delivery
//! ==============================================================================
//!
//! purpose:
//!     every cycle one `DataPoint` is appended to the pending buffer and the
//!     collector gets a single shot at taking it (plus anything still pending).
//!     the collector reports back a `Delivery`; the publisher alone touches the
//!     buffer, and only after the call has returned.
//!
//! transports:
//!     - http: batched POST, failures keep everything for the next cycle.
//!     - home_assistant: one POST per attribute, latest values only.
//!     - mqtt: fire-and-forget, failures are dropped.
//!
//! relationships:
//!     - used by: control.rs (PUBLISH step), main.rs (connect at startup)
//!     - uses: locator.rs (collector address for http / home assistant)
//!
//! ==============================================================================

mod buffer;
pub mod home_assistant;
pub mod http;
pub mod mqtt;

pub use buffer::PendingBuffer;

use std::net::IpAddr;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DaemonConfig, TransportKind};
use crate::domain::{CollectorEndpoint, DataPoint, Protocol};
use crate::locator::{DnsResolver, ServiceLocator};
use crate::retry::RetryPolicy;

use home_assistant::HomeAssistantCollector;
use http::HttpCollector;
use mqtt::MqttCollector;

/// What the collector did with the points it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// the first n points are safely with the collector
    Acknowledged(usize),
    /// nothing confirmed, keep everything for the next attempt
    Retained,
    /// not confirmed and not worth keeping
    Dropped,
}

#[allow(async_fn_in_trait)]
pub trait Collector {
    /// One delivery attempt. Must not fail past its own boundary.
    async fn deliver(&mut self, points: &[DataPoint]) -> Delivery;
}

pub struct TelemetryPublisher<C> {
    collector: C,
    pending: PendingBuffer,
}

impl<C: Collector> TelemetryPublisher<C> {
    pub fn new(collector: C, cap: Option<usize>) -> Self {
        Self { collector, pending: PendingBuffer::new(cap) }
    }

    /// Queue `point` and try to hand over everything pending.
    pub async fn publish(&mut self, point: DataPoint) -> Delivery {
        self.pending.push(point);
        let outcome = self.collector.deliver(self.pending.points()).await;
        match outcome {
            Delivery::Acknowledged(count) => self.pending.acknowledge(count),
            Delivery::Retained => {
                debug!(pending = self.pending.len(), "keeping data points for the next cycle");
            }
            Delivery::Dropped => {
                warn!(lost = self.pending.len(), "data points not delivered and dropped");
                self.pending.clear();
            }
        }
        outcome
    }

    pub fn pending(&self) -> &PendingBuffer {
        &self.pending
    }

    #[cfg(test)]
    pub(crate) fn collector_ref(&self) -> &C {
        &self.collector
    }
}

pub enum AnyCollector {
    Http(HttpCollector),
    HomeAssistant(HomeAssistantCollector),
    Mqtt(MqttCollector),
}

impl Collector for AnyCollector {
    async fn deliver(&mut self, points: &[DataPoint]) -> Delivery {
        match self {
            AnyCollector::Http(collector) => collector.deliver(points).await,
            AnyCollector::HomeAssistant(collector) => collector.deliver(points).await,
            AnyCollector::Mqtt(collector) => collector.deliver(points).await,
        }
    }
}

/// Build the configured transport, looking the collector up first when needed.
pub async fn connect(config: &DaemonConfig) -> Result<AnyCollector> {
    let timeout = config.publish.timeout();
    match config.publish.transport {
        TransportKind::Http => {
            let http = &config.publish.http;
            let endpoint = CollectorEndpoint {
                host: resolve_host(http.host.as_deref(), http.service.as_deref(), http.nameserver).await?,
                port: http.port,
                protocol: Protocol::Http,
                auth_token: None,
            };
            log_endpoint(&endpoint);
            Ok(AnyCollector::Http(HttpCollector::new(&endpoint, &http.path, http.batch, timeout)?))
        }
        TransportKind::HomeAssistant => {
            let ha = &config.publish.home_assistant;
            let endpoint = CollectorEndpoint {
                host: resolve_host(ha.host.as_deref(), ha.service.as_deref(), ha.nameserver).await?,
                port: ha.port,
                protocol: Protocol::HomeAssistant,
                auth_token: ha.token.clone(),
            };
            log_endpoint(&endpoint);
            let name = ha
                .sensor_name
                .as_deref()
                .ok_or_else(|| anyhow!("home assistant sensor name missing"))?;
            Ok(AnyCollector::HomeAssistant(HomeAssistantCollector::new(&endpoint, name, timeout)?))
        }
        TransportKind::Mqtt => {
            let mqtt = &config.publish.mqtt;
            let host = mqtt.host.clone().ok_or_else(|| anyhow!("mqtt host missing"))?;
            log_endpoint(&CollectorEndpoint {
                host,
                port: mqtt.port,
                protocol: Protocol::Mqtt,
                auth_token: None,
            });
            let collector = MqttCollector::connect(mqtt)?;
            if let (Some(device), Some(sensor_name)) = (&config.discovery.device, &config.discovery.sensor_name) {
                collector.announce(config.sensor.kind, device, sensor_name);
            }
            Ok(AnyCollector::Mqtt(collector))
        }
    }
}

fn log_endpoint(endpoint: &CollectorEndpoint) {
    info!(protocol = ?endpoint.protocol, url = %endpoint.base_url(), "collector endpoint");
}

/// Only the batching http transport keeps points across failures.
pub fn buffer_cap(config: &DaemonConfig) -> Option<usize> {
    match config.publish.transport {
        TransportKind::Http => config.publish.http.max_pending,
        _ => None,
    }
}

async fn resolve_host(host: Option<&str>, service: Option<&str>, nameserver: IpAddr) -> Result<String> {
    if let Some(host) = host {
        return Ok(host.to_string());
    }
    let service = service.ok_or_else(|| anyhow!("no collector host or service name configured"))?;
    let locator = ServiceLocator::new(DnsResolver::new(nameserver), RetryPolicy::forever());
    Ok(locator.locate(service).await.to_string())
}

/// `5.0`, `21.37`: whole numbers keep one decimal.
pub fn format_value(value: f32) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}
