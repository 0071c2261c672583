//! Fan-out of relay frames to every peer in a project room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; a peer that falls further behind loses the oldest frames.
//!
//! Frames carry their origin so a connection can skip what it sent itself.
//! Frames with no origin (authoritative `entity_updated`) go to everyone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::model::{PresenceStatus, Timestamp, User, UserId};
use crate::protocol::{ProtocolError, WireMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// One encoded frame in flight.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Sender to skip on delivery; `None` reaches every peer.
    pub origin: Option<UserId>,
    pub frame: Arc<Vec<u8>>,
}

impl Envelope {
    /// Whether this frame should be delivered to `peer`.
    pub fn is_for(&self, peer: UserId) -> bool {
        self.origin != Some(peer)
    }
}

/// A broadcast group for a single project room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    /// Connected peers and their latest presence
    peers: Arc<RwLock<HashMap<UserId, User>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given per-peer buffer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(&self, user: User) -> broadcast::Receiver<Envelope> {
        let mut peers = self.peers.write().await;
        peers.insert(user.id, user);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, user_id: &UserId) -> Option<User> {
        self.peers.write().await.remove(user_id)
    }

    /// Record a peer's latest presence so later snapshots carry it.
    pub async fn set_presence(&self, user_id: &UserId, status: PresenceStatus, at: Timestamp) {
        if let Some(user) = self.peers.write().await.get_mut(user_id) {
            if at >= user.last_seen {
                user.status = status;
                user.last_seen = at;
            }
        }
    }

    /// Encode once and fan out. Returns the number of receivers reached.
    pub fn broadcast(
        &self,
        msg: &WireMessage,
        origin: Option<UserId>,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(Envelope { origin, frame }))
    }

    /// Fan out a pre-encoded frame.
    pub fn broadcast_raw(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Count frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<User> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, user_id: &UserId) -> bool {
        self.peers.read().await.contains_key(user_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let user = User::new("Alice");
        let user_id = user.id;

        let _rx = group.add_peer(user).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&user_id).await);

        group.remove_peer(&user_id).await;
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&user_id).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_with_origin() {
        let group = BroadcastGroup::new(16);
        let alice = User::new("Alice");
        let bob = User::new("Bob");

        let mut rx_alice = group.add_peer(alice.clone()).await;
        let mut rx_bob = group.add_peer(bob.clone()).await;

        let msg = WireMessage::ActivityUpdate {
            user_id: alice.id,
            entity_id: Uuid::new_v4(),
            active: true,
        };
        let count = group.broadcast(&msg, Some(alice.id)).unwrap();
        // Both receivers get it; filtering is the connection's job.
        assert_eq!(count, 2);

        let to_alice = rx_alice.recv().await.unwrap();
        let to_bob = rx_bob.recv().await.unwrap();
        assert!(!to_alice.is_for(alice.id));
        assert!(to_bob.is_for(bob.id));
        assert_eq!(WireMessage::decode(&to_bob.frame).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_authoritative_frames_reach_sender() {
        let envelope = Envelope {
            origin: None,
            frame: Arc::new(vec![1, 2, 3]),
        };
        assert!(envelope.is_for(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_set_presence_is_monotonic() {
        let group = BroadcastGroup::new(16);
        let mut user = User::new("Ezri");
        user.last_seen = 100;
        let id = user.id;
        let _rx = group.add_peer(user).await;

        group.set_presence(&id, PresenceStatus::Away, 200).await;
        group.set_presence(&id, PresenceStatus::Online, 150).await;

        let peers = group.peers().await;
        assert_eq!(peers[0].status, PresenceStatus::Away);
        assert_eq!(peers[0].last_seen, 200);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let user = User::new("Alice");
        let _rx = group.add_peer(user.clone()).await;

        let msg = WireMessage::UserLeft { user_id: user.id };
        group.broadcast(&msg, None).unwrap();
        group.broadcast(&msg, None).unwrap();
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_broadcast_capacity() {
        let group = BroadcastGroup::new(32);
        assert_eq!(group.capacity(), 32);
    }
}
