//! Per-dataset connection set.
//!
//! Tracks the replicas currently connected to one dataset and fans
//! accepted entries out to them. Each peer has a bounded outbound queue;
//! a peer that stops reading fills its queue and is disconnected rather
//! than blocking acceptance of further inbound entries. There is no
//! process-wide registry - a [`PeerSet`] is owned by its dataset and
//! passed by reference to broadcast calls.

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Outbound frames queued per peer before overflow disconnects it.
pub const OUTBOUND_QUEUE: usize = 256;

/// Sender for pre-encoded wire frames.
pub type FrameSender = mpsc::Sender<Bytes>;

/// A single connected replica.
#[derive(Debug)]
pub struct Peer {
    /// Unique identifier for this connection
    pub id: String,
    /// Bounded channel feeding this connection's writer task
    pub sender: FrameSender,
}

/// The replicas connected to one dataset.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: DashMap<String, Peer>,
}

impl PeerSet {
    /// Create an empty peer set.
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Register a new connection. Returns the peer ID.
    pub fn register(&self, sender: FrameSender) -> String {
        let peer_id = uuid::Uuid::new_v4().to_string();
        self.peers.insert(
            peer_id.clone(),
            Peer {
                id: peer_id.clone(),
                sender,
            },
        );
        tracing::info!(peer = %peer_id, "replica connection registered");
        peer_id
    }

    /// Unregister a connection.
    pub fn unregister(&self, peer_id: &str) {
        if self.peers.remove(peer_id).is_some() {
            tracing::info!(peer = %peer_id, "replica connection unregistered");
        }
    }

    /// Send a frame to one peer. A full or closed queue disconnects that
    /// peer and returns false.
    pub fn send_to(&self, peer_id: &str, frame: Bytes) -> bool {
        let delivered = match self.peers.get(peer_id) {
            Some(peer) => peer.sender.try_send(frame).is_ok(),
            None => return false,
        };
        if !delivered {
            tracing::warn!(peer = %peer_id, "outbound queue overflow, disconnecting peer");
            self.unregister(peer_id);
        }
        delivered
    }

    /// Send a frame to every peer except `exclude` (the sender of the
    /// entries being rebroadcast). Returns how many peers received it.
    ///
    /// Fire-and-forget per peer: a slow peer is dropped, never waited on.
    pub fn broadcast_except(&self, exclude: &str, frame: Bytes) -> usize {
        let mut delivered = 0;
        let mut stalled = Vec::new();

        for entry in self.peers.iter() {
            let peer = entry.value();
            if peer.id == exclude {
                continue;
            }
            match peer.sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => stalled.push(peer.id.clone()),
            }
        }

        for peer_id in stalled {
            tracing::warn!(peer = %peer_id, "outbound queue overflow, disconnecting peer");
            self.unregister(&peer_id);
        }

        delivered
    }

    /// Number of connected replicas.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no replica is connected.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_unregister() {
        let peers = PeerSet::new();
        let (tx, _rx) = mpsc::channel(4);

        let id = peers.register(tx);
        assert_eq!(peers.len(), 1);

        peers.unregister(&id);
        assert!(peers.is_empty());
    }

    #[test]
    fn broadcast_skips_sender() {
        let peers = PeerSet::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);

        let sender = peers.register(tx1);
        let _other = peers.register(tx2);

        let delivered = peers.broadcast_except(&sender, Bytes::from_static(b"frame"));
        assert_eq!(delivered, 1);

        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), Bytes::from_static(b"frame"));
    }

    #[test]
    fn overflowing_peer_is_disconnected() {
        let peers = PeerSet::new();
        let (tx, _rx) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(4);

        let stalled = peers.register(tx);
        let healthy = peers.register(tx2);

        // Fill the stalled peer's queue, then overflow it.
        assert!(peers.send_to(&stalled, Bytes::from_static(b"a")));
        let delivered = peers.broadcast_except("none", Bytes::from_static(b"b"));

        assert_eq!(delivered, 1);
        assert_eq!(peers.len(), 1);
        assert!(peers.send_to(&healthy, Bytes::from_static(b"c")));
        assert_eq!(rx2.try_recv().unwrap(), Bytes::from_static(b"b"));
    }
}
