//! ==============================================================================
//! status.rs - local read-only status endpoint
//! ==============================================================================
//!
//! the control loop writes a snapshot after every cycle; the web server only
//! ever reads it. `GET /api` returns the snapshot as json.
//!
//! shared state uses arc<rwlock<>> so the server never blocks a cycle for
//! longer than a clone.
//!
//! ==============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::domain::{ActuatorState, Reading};
use crate::publish::Delivery;

#[derive(Clone, Debug, Default, Serialize)]
pub struct StatusSnapshot {
    /// last successful reading
    pub reading: Option<Reading>,
    pub relays: Vec<RelayStatus>,
    /// points waiting for the collector
    pub pending: usize,
    pub last_delivery: Option<Delivery>,
    pub cycles: u64,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub name: String,
    pub state: &'static str,
}

impl From<&ActuatorState> for RelayStatus {
    fn from(state: &ActuatorState) -> Self {
        Self { name: state.name.clone(), state: state.label() }
    }
}

pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

pub fn router(state: SharedStatus) -> Router {
    Router::new()
        .route("/api", get(api_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(state: SharedStatus, bind: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %bind, "status endpoint listening");
    serve(listener, state).await
}

async fn serve(listener: TcpListener, state: SharedStatus) -> Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn api_handler(State(state): State<SharedStatus>) -> Json<StatusSnapshot> {
    let state = state.read().await;
    Json(state.clone())
}
