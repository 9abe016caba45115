//! Ferry Relay - the authoritative endpoint replicas synchronize against.
//!
//! One relay serves many datasets; each dataset has its own store and its
//! own set of connected replicas, with no cross-talk. Inbound entries are
//! applied through the conflict resolver, persisted, acknowledged to the
//! sender, and rebroadcast to every other replica of that dataset - never
//! echoed back to the sender.

pub mod auth;
pub mod config;
pub mod dataset;
pub mod error;
pub mod peer;
pub mod routes;
pub mod session;

use crate::config::Config;
use crate::dataset::DatasetHub;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<DatasetHub>,
}

/// Build the relay router over the given state.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
