//! In-process broadcast of committed changes.
//!
//! Every commit - a local write transaction or the application of a remote
//! batch - publishes exactly one [`ChangeBatch`] to all subscribers. There
//! is no separate echo for acknowledgments: marking entries synced changes
//! no record state and publishes nothing, so an observer sees one
//! notification per commit, never one for the write and one for the ack.

use crate::ChangeEntry;
use thiserror::Error;
use tokio::sync::broadcast;

/// Where the entries in a batch were committed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrigin {
    /// A local write transaction on this replica
    Local,
    /// Remote entries applied through the synchronizer
    Remote,
}

/// All entries from one commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub entries: Vec<ChangeEntry>,
    pub origin: BatchOrigin,
}

/// Error from [`Subscription::recv`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The replica owning this stream was dropped
    #[error("change stream closed")]
    Closed,
    /// This subscriber fell behind; carries the number of missed batches
    #[error("change stream lagged, {0} batches missed")]
    Lagged(u64),
}

/// Fan-out point for committed batches.
///
/// Backed by a bounded broadcast ring: a subscriber that stops reading
/// observes [`StreamError::Lagged`] rather than blocking committers.
#[derive(Debug)]
pub struct ChangeStream {
    tx: broadcast::Sender<ChangeBatch>,
}

impl ChangeStream {
    /// Create a stream retaining up to `capacity` undelivered batches
    /// per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all batches committed after this call.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Publish one commit's batch. A batch with no entries is not
    /// published; nothing changed.
    pub fn publish(&self, batch: ChangeBatch) {
        if batch.entries.is_empty() {
            return;
        }
        // No subscribers is fine; the log is the durable record.
        let _ = self.tx.send(batch);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeStream {
    fn default() -> Self {
        Self::new(64)
    }
}

/// One subscriber's view of the stream.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<ChangeBatch>,
}

impl Subscription {
    /// Wait for the next committed batch.
    pub async fn recv(&mut self) -> Result<ChangeBatch, StreamError> {
        match self.rx.recv().await {
            Ok(batch) => Ok(batch),
            Err(broadcast::error::RecvError::Closed) => Err(StreamError::Closed),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(StreamError::Lagged(n)),
        }
    }

    /// Non-blocking receive, for callers polling between commits.
    pub fn try_recv(&mut self) -> Option<ChangeBatch> {
        self.rx.try_recv().ok()
    }
}
