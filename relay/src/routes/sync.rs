//! Sync endpoint: the WebSocket upgrade replicas connect to.

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::Response,
    routing::get,
    Router,
};
use ferry_engine::GlobalId;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::dataset;
use crate::error::{AppError, Result};
use crate::session;
use crate::AppState;

/// Connect-time query parameters.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Dataset this replica belongs to
    dataset: String,
    /// Watermark to resume from; absent means full history
    #[serde(rename = "last-event-id")]
    last_event_id: Option<String>,
}

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/sync/ws", get(ws_handler))
}

/// GET /sync/ws - upgrade to the replication protocol.
async fn ws_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    if !dataset::valid_name(&query.dataset) {
        return Err(AppError::BadRequest(format!(
            "invalid dataset name: {:?}",
            query.dataset
        )));
    }

    let watermark = query
        .last_event_id
        .as_deref()
        .map(GlobalId::parse)
        .transpose()
        .map_err(|_| AppError::BadRequest("invalid last-event-id".to_string()))?;

    let dataset = state.hub.get_or_open(&query.dataset)?;

    Ok(ws.on_upgrade(move |socket| session::handle_socket(socket, dataset, watermark)))
}
