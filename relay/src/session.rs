//! Per-connection session handling.
//!
//! Each replica connection runs as its own task with its own read loop.
//! On connect the session serves catch-up from the requested watermark,
//! then ingests inbound batches: apply through the resolver, persist,
//! ack the sender, rebroadcast accepted entries to the other replicas of
//! the dataset - never back to the sender.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use ferry_engine::{
    wire::{self, Frame},
    GlobalId,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::dataset::Dataset;
use crate::peer::OUTBOUND_QUEUE;

/// Entries per catch-up frame, to bound message size.
const CATCHUP_CHUNK: usize = 500;

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the peer with the dataset's connection set
/// 2. Streams catch-up entries after the requested watermark
/// 3. Spawns a task to forward queued outbound frames
/// 4. Processes inbound frames in a loop
/// 5. Cleans up on disconnect
pub async fn handle_socket(
    socket: WebSocket,
    dataset: Arc<Dataset>,
    watermark: Option<GlobalId>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);
    let peer_id = dataset.peers.register(tx);

    tracing::info!(
        peer = %peer_id,
        dataset = %dataset.name,
        watermark = ?watermark,
        "replica connected"
    );

    // Serve catch-up directly on the socket before draining the queue, so
    // history arrives ahead of any broadcast that raced the connection.
    // Registration already happened, so nothing committed after the scan
    // is missed - it waits in the queue.
    let backlog = {
        let store = dataset.store.lock().await;
        store.entries_after(watermark)
    };
    match backlog {
        Ok(entries) => {
            if !entries.is_empty() {
                tracing::debug!(
                    peer = %peer_id,
                    count = entries.len(),
                    "serving catch-up"
                );
            }
            for chunk in entries.chunks(CATCHUP_CHUNK) {
                let frame = wire::encode(&Frame::Changes(chunk.to_vec()));
                if ws_sender.send(Message::Binary(frame)).await.is_err() {
                    dataset.peers.unregister(&peer_id);
                    return;
                }
            }
        }
        Err(e) => {
            tracing::error!(peer = %peer_id, "catch-up scan failed: {e}");
            dataset.peers.unregister(&peer_id);
            return;
        }
    }

    // Forward queued frames (acks and broadcasts) to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Binary(frame)).await {
                tracing::warn!("failed to send frame: {e}");
                break;
            }
        }
    });

    // Process inbound frames.
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Binary(payload)) => {
                if let Err(e) = ingest_frame(&dataset, &peer_id, &payload).await {
                    // Storage failure: drop the connection and let the
                    // replica's reconnect redeliver the batch.
                    tracing::error!(peer = %peer_id, "ingest failed: {e}");
                    break;
                }
            }
            Ok(Message::Text(_)) => {
                tracing::warn!("text frames not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(peer = %peer_id, "close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(peer = %peer_id, "socket error: {e}");
                break;
            }
        }
    }

    // Clean up
    dataset.peers.unregister(&peer_id);
    send_task.abort();

    tracing::info!(
        peer = %peer_id,
        dataset = %dataset.name,
        active_peers = dataset.peers.len(),
        "replica disconnected"
    );
}

/// Ingest one inbound frame from a replica.
async fn ingest_frame(
    dataset: &Dataset,
    peer_id: &str,
    payload: &[u8],
) -> ferry_engine::Result<()> {
    match wire::decode(payload) {
        Ok(Frame::Changes(entries)) => {
            if entries.is_empty() {
                return Ok(());
            }

            let ingest = {
                let mut store = dataset.store.lock().await;
                store.apply(&entries)?
            };

            // Ack durable receipt of everything processed, then fan the
            // accepted entries out to the rest of the dataset.
            if !ingest.processed.is_empty() {
                dataset
                    .peers
                    .send_to(peer_id, wire::encode(&Frame::Ack(ingest.processed)));
            }
            if !ingest.accepted.is_empty() {
                let frame = wire::encode(&Frame::Changes(ingest.accepted));
                let delivered = dataset.peers.broadcast_except(peer_id, frame);
                tracing::debug!(
                    peer = %peer_id,
                    delivered,
                    "rebroadcast accepted entries"
                );
            }
            Ok(())
        }
        Ok(Frame::Ack(_)) => {
            tracing::warn!(peer = %peer_id, "unexpected ack frame from replica");
            Ok(())
        }
        Err(e) => {
            // Malformed frames are dropped without tearing down the
            // connection.
            tracing::warn!(peer = %peer_id, "dropping malformed frame: {e}");
            Ok(())
        }
    }
}
