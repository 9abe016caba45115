//! The client-side synchronizer.
//!
//! Owns one WebSocket connection to a relay and runs the upload and
//! download flows over it. Local writes never wait on the network: they
//! commit to the replica and queue in the change log, and the
//! synchronizer picks them up from the `synced = 0` scan. Entries are
//! marked synchronized only when the relay acks their global ids - never
//! optimistically - so any reconnect resumes from the first unacked entry
//! and from the persisted download watermark.

use crate::{
    replica::Replica,
    stream::{BatchOrigin, StreamError},
    wire::{self, Frame},
    Result,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::header::AUTHORIZATION, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Connection status, observable while the synchronizer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Disconnected,
    Connecting,
    Streaming,
}

/// Opaque connection configuration; the engine passes these through
/// without interpreting them beyond presence.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Relay WebSocket endpoint, e.g. `ws://localhost:3000/sync/ws`
    pub endpoint: String,
    /// Dataset this replica belongs to
    pub dataset: String,
    /// Bearer credential presented on connect, if any
    pub token: Option<String>,
    /// Entries per upload frame
    pub upload_chunk: usize,
    /// First reconnect delay
    pub reconnect_initial: Duration,
    /// Reconnect delay ceiling
    pub reconnect_max: Duration,
}

impl SyncOptions {
    pub fn new(endpoint: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            dataset: dataset.into(),
            token: None,
            upload_chunk: 256,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Handle to a running synchronizer task.
///
/// Dropping the handle leaves the task running; call [`shutdown`] to close
/// the connection and stop. The replica's log stays consistent across a
/// shutdown at any point and can resume later.
///
/// [`shutdown`]: Synchronizer::shutdown
pub struct Synchronizer {
    handle: tokio::task::JoinHandle<()>,
    status: watch::Receiver<SyncStatus>,
    shutdown: watch::Sender<bool>,
}

impl Synchronizer {
    /// Spawn the sync task for a shared replica.
    pub fn spawn(replica: Arc<Mutex<Replica>>, options: SyncOptions) -> Self {
        let (status_tx, status_rx) = watch::channel(SyncStatus::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run(replica, options, status_tx, shutdown_rx));

        Self {
            handle,
            status: status_rx,
            shutdown: shutdown_tx,
        }
    }

    /// Watch the connection status.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Wait until the synchronizer reports the given status.
    pub async fn wait_until(&self, status: SyncStatus) {
        let mut rx = self.status.clone();
        loop {
            if *rx.borrow_and_update() == status {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close the connection and stop the task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

// A poisoned lock only means another thread panicked mid-write; the
// SQLite transaction it held has already rolled back.
fn lock(replica: &Arc<Mutex<Replica>>) -> MutexGuard<'_, Replica> {
    replica.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

async fn run(
    replica: Arc<Mutex<Replica>>,
    options: SyncOptions,
    status: watch::Sender<SyncStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(options.reconnect_initial, options.reconnect_max);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let _ = status.send(SyncStatus::Connecting);
        match connect(&replica, &options).await {
            Ok(ws) => {
                backoff.reset();
                let _ = status.send(SyncStatus::Streaming);
                if let Err(e) = drive(ws, &replica, &options, &mut shutdown).await {
                    tracing::warn!("sync connection ended: {e}");
                }
            }
            Err(e) => {
                tracing::warn!(endpoint = %options.endpoint, "sync connect failed: {e}");
            }
        }
        let _ = status.send(SyncStatus::Disconnected);

        if *shutdown.borrow() {
            break;
        }
        let delay = backoff.next();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    let _ = status.send(SyncStatus::Disconnected);
}

async fn connect(replica: &Arc<Mutex<Replica>>, options: &SyncOptions) -> Result<WsStream> {
    let watermark = lock(replica).watermark()?;

    let mut url = format!("{}?dataset={}", options.endpoint, options.dataset);
    if let Some(id) = watermark {
        url.push_str(&format!("&last-event-id={id}"));
    }

    let mut request = url
        .into_client_request()
        .map_err(|e| crate::Error::Endpoint(e.to_string()))?;
    if let Some(token) = &options.token {
        let value = format!("Bearer {token}")
            .parse()
            .map_err(|_| crate::Error::Endpoint("credential is not header-safe".into()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (ws, _response) = connect_async(request).await?;
    tracing::info!(
        dataset = %options.dataset,
        watermark = ?watermark,
        "connected to relay"
    );
    Ok(ws)
}

async fn drive(
    ws: WsStream,
    replica: &Arc<Mutex<Replica>>,
    options: &SyncOptions,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (mut sink, mut inbound) = ws.split();
    let mut local_commits = lock(replica).subscribe();

    // Upload catch-up: everything the relay has not acknowledged.
    upload_pending(replica, &mut sink, options.upload_chunk).await?;

    loop {
        tokio::select! {
            message = inbound.next() => match message {
                None => return Ok(()),
                Some(Ok(Message::Binary(payload))) => handle_frame(replica, &payload)?,
                Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Ok(Message::Text(_))) => {
                    tracing::warn!("ignoring unexpected text frame");
                }
                Some(Ok(_)) => {} // ping/pong handled by the library
                Some(Err(e)) => return Err(e.into()),
            },
            batch = local_commits.recv() => match batch {
                Ok(batch) if batch.origin == BatchOrigin::Local => {
                    upload_pending(replica, &mut sink, options.upload_chunk).await?;
                }
                Ok(_) => {}
                // Missing notifications is fine; the next scan picks up
                // everything still unsynchronized.
                Err(StreamError::Lagged(_)) => {
                    upload_pending(replica, &mut sink, options.upload_chunk).await?;
                }
                Err(StreamError::Closed) => return Ok(()),
            },
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

/// Apply one inbound frame. Malformed frames are dropped without tearing
/// down the connection; storage failures end the connection so the next
/// catch-up retries the batch.
fn handle_frame(replica: &Arc<Mutex<Replica>>, payload: &[u8]) -> Result<()> {
    match wire::decode(payload) {
        Ok(Frame::Changes(entries)) => {
            if entries.is_empty() {
                return Ok(());
            }
            let mut guard = lock(replica);
            let report = guard.apply_remote(&entries)?;
            if let Some(last) = entries.last() {
                guard.set_watermark(last.global_id)?;
            }
            drop(guard);
            tracing::debug!(
                applied = report.applied.len(),
                rejected = report.rejected.len(),
                skipped = report.skipped.len(),
                parked = report.parked.len(),
                "applied remote batch"
            );
            Ok(())
        }
        Ok(Frame::Ack(ids)) => {
            let marked = lock(replica).mark_synchronized(&ids)?;
            tracing::debug!(acked = ids.len(), marked, "relay acknowledged entries");
            Ok(())
        }
        Err(e) => {
            tracing::warn!("dropping malformed frame: {e}");
            Ok(())
        }
    }
}

async fn upload_pending(
    replica: &Arc<Mutex<Replica>>,
    sink: &mut WsSink,
    chunk: usize,
) -> Result<()> {
    let pending = lock(replica).unsynchronized()?;
    if pending.is_empty() {
        return Ok(());
    }

    tracing::debug!(count = pending.len(), "uploading unsynchronized entries");
    for entries in pending.chunks(chunk.max(1)) {
        let frame = wire::encode(&Frame::Changes(entries.to_vec()));
        sink.send(Message::Binary(frame)).await?;
    }
    Ok(())
}
