//! Coordinator status snapshot and its HTTP endpoint.
//!
//! `GET /status` returns the current [`CoordinatorStatus`] as JSON for
//! dashboards and health checks.

use crate::state::CoordinatorState;
use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Status server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Coordinator state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Ripping,
    CoolingDown,
    WaitingForRemoval,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub phase: Phase,
    pub is_ripping: bool,
    pub last_ripped_disc: Option<String>,
    /// Seconds until the last ripped disc may be ripped again
    pub cooldown_remaining_secs: u64,
    pub waiting_for_disc_removal: bool,
    pub last_disc_present: bool,
    pub completed_cycles: u64,
    pub failed_cycles: u64,
    pub last_error: Option<String>,
}

async fn get_status(State(state): State<Arc<CoordinatorState>>) -> Json<CoordinatorStatus> {
    Json(state.status().await)
}

pub fn create_status_router(state: Arc<CoordinatorState>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(state)
}

/// Serve the status endpoint until the process exits.
pub async fn run_status_server(state: Arc<CoordinatorState>, bind: &str) -> Result<(), ServerError> {
    let app = create_status_router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = %bind, "status endpoint listening");

    axum::serve(listener, app).await.map_err(ServerError::Serve)?;
    Ok(())
}
