//! Batched JSON POSTs to the HTTP collector (`POST /api/dht22/`).

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use super::{Collector, Delivery};
use crate::domain::{CollectorEndpoint, DataPoint};
use crate::error::PublishError;

pub struct HttpCollector {
    client: reqwest::Client,
    url: String,
    batch: bool,
}

impl HttpCollector {
    pub fn new(endpoint: &CollectorEndpoint, path: &str, batch: bool, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };
        Ok(Self {
            client,
            url: format!("{}{}", endpoint.base_url(), path),
            batch,
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, body: &T) -> Result<(), PublishError> {
        let response = self.client.post(&self.url).json(body).send().await?;
        match response.status().as_u16() {
            200 | 201 => Ok(()),
            code => Err(PublishError::Status(code)),
        }
    }
}

impl Collector for HttpCollector {
    async fn deliver(&mut self, points: &[DataPoint]) -> Delivery {
        if self.batch {
            return match self.post(points).await {
                Ok(()) => {
                    info!("Sent {} data points", points.len());
                    Delivery::Acknowledged(points.len())
                }
                Err(err) => {
                    warn!(error = %err, pending = points.len(), "Server unavailable. Caching data point(s)");
                    Delivery::Retained
                }
            };
        }

        let mut sent = 0;
        for point in points {
            if let Err(err) = self.post(point).await {
                warn!(error = %err, pending = points.len() - sent, "Server unavailable. Caching data point(s)");
                break;
            }
            sent += 1;
        }
        if sent == 0 {
            Delivery::Retained
        } else {
            info!("Sent {} data points", sent);
            Delivery::Acknowledged(sent)
        }
    }
}
