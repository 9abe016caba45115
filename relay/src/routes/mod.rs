//! The relay's HTTP surface: a status probe and the WebSocket upgrade
//! replicas connect through. Everything else is wire protocol.

mod health;
mod sync;

use crate::AppState;
use axum::Router;

/// Assemble every relay route.
pub fn create_routes() -> Router<AppState> {
    Router::new().merge(health::routes()).merge(sync::routes())
}
