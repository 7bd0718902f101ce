//! Per-room fan-out of encoded protocol messages.
//!
//! One tokio broadcast channel per room; each session holds its own
//! receiver buffering up to `capacity` messages. Messages are encoded once
//! and shared as `Arc<Vec<u8>>`. Filtering out the sender's own messages is
//! the receiving session's job.
//!
//! A peer id registered twice (a reconnect racing its own teardown) keeps
//! only the newest registration; [`BroadcastGroup::release`] with a stale
//! registration number is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Snapshot of broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct Registration {
    info: PeerInfo,
    number: u64,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, Registration>>,
    next_registration: AtomicU64,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many messages a receiver may fall behind before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            next_registration: AtomicU64::new(0),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.register(info).await.1
    }

    /// Register a peer, replacing any earlier registration of the same id.
    /// Returns the registration number to hand back to [`Self::release`].
    pub async fn register(&self, info: PeerInfo) -> (u64, broadcast::Receiver<Arc<Vec<u8>>>) {
        let number = self.next_registration.fetch_add(1, Ordering::Relaxed) + 1;
        let mut peers = self.peers.write().await;
        if peers.contains_key(&info.peer_id) {
            log::debug!("Peer {} re-registered", info.peer_id);
        }
        peers.insert(info.peer_id, Registration { info, number });
        (number, self.sender.subscribe())
    }

    /// Remove `peer_id` only if `number` is still its current registration.
    pub async fn release(&self, peer_id: &Uuid, number: u64) -> Option<PeerInfo> {
        let mut peers = self.peers.write().await;
        match peers.get(peer_id) {
            Some(current) if current.number == number => {
                peers.remove(peer_id).map(|registration| registration.info)
            }
            _ => None,
        }
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers
            .write()
            .await
            .remove(peer_id)
            .map(|registration| registration.info)
    }

    /// Encode once and send to every receiver. Returns the receiver count.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Send pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .await
            .values()
            .map(|registration| registration.info.clone())
            .collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
