//! HTTP routes served by the drainpipe binary
//!
//! Route handlers are collaborators of the lifecycle core: the only contract
//! between them is [`AppState::tasks`]. A handler that keeps working after
//! its response is sent must run that work through the tracker so shutdown
//! waits for it.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::config::ServiceConfig;
use crate::tracker::BackgroundTaskTracker;

/// Shared application state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub tasks: BackgroundTaskTracker,
}

impl AppState {
    /// Create application state from configuration and the task tracker
    /// shared with the shutdown coordinator.
    pub fn new(config: ServiceConfig, tasks: BackgroundTaskTracker) -> Self {
        Self {
            config: Arc::new(config),
            tasks,
        }
    }
}

/// Create the router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthcheck", get(healthcheck))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Healthcheck {
    status: &'static str,
    system_info: SystemInfo,
}

#[derive(Debug, Serialize)]
struct SystemInfo {
    environment: String,
    version: &'static str,
}

/// Report that the service is up, with its environment and version
async fn healthcheck(State(state): State<AppState>) -> Json<Healthcheck> {
    Json(Healthcheck {
        status: "available",
        system_info: SystemInfo {
            environment: state.config.env.clone(),
            version: env!("CARGO_PKG_VERSION"),
        },
    })
}
