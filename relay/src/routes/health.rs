//! Status endpoints for deployment probes.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

/// Relay status summary.
#[derive(Serialize)]
pub struct Status {
    pub status: &'static str,
    pub version: &'static str,
    /// Datasets opened since the relay started
    pub datasets: usize,
}

/// Create status routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

async fn health_check(State(state): State<AppState>) -> Json<Status> {
    Json(Status {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        datasets: state.hub.len(),
    })
}

async fn root() -> &'static str {
    "Ferry Relay"
}
