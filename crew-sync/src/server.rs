//! Development relay: WebSocket fan-out with per-project rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (project_id) ── entity records ── BroadcastGroup
//! Client B ──┘                                               │
//!                                          ┌─────────────────┼───────────┐
//!                                          ▼                 ▼           ▼
//!                                       Client A          Client B    Client C
//! ```
//!
//! Each project room keeps:
//! - The latest copy of every entity written through it
//! - A `BroadcastGroup` for fan-out to connected peers
//! - Peer presence for join-time snapshots
//!
//! `entity_update` is applied field by field, stamped and broadcast as
//! `entity_updated` to every peer, the sender included: that echo is how
//! clients learn their write was accepted. The relay never judges
//! conflicts; it applies writes in arrival order. Presence and activity
//! are forwarded to the other peers only.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::model::{now_millis, Entity, EntityId, EntityKind, FieldMap, Timestamp, User};
use crate::protocol::WireMessage;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub entity_updates: u64,
}

/// Project room: entity records + broadcast group.
struct ProjectRoom {
    entities: HashMap<EntityId, Entity>,
    broadcast: Arc<BroadcastGroup>,
}

impl ProjectRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            entities: HashMap::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }

    /// Apply a field-wise write and return the resulting entity.
    fn apply(
        &mut self,
        entity_id: EntityId,
        kind: EntityKind,
        changes: &FieldMap,
        base_version: Timestamp,
        author: &User,
    ) -> Entity {
        let record = self
            .entities
            .entry(entity_id)
            .or_insert_with(|| Entity::new(entity_id, kind, author.id));

        if base_version < record.last_modified {
            log::debug!(
                "{} wrote {entity_id} from v{base_version} (current v{}); applying in arrival order",
                author.name,
                record.last_modified
            );
        }

        record.apply_changes(changes);
        record.last_modified = now_millis().max(record.last_modified + 1);
        record.modified_by = author.id;
        record.clone()
    }
}

type Rooms = Arc<RwLock<HashMap<Uuid, ProjectRoom>>>;

/// A joined peer: who, which room, and the room's fan-out.
type Member = (User, Uuid, Arc<BroadcastGroup>);

/// The development relay.
pub struct RelayServer {
    config: RelayConfig,
    /// Project rooms: project_id → entity records + BroadcastGroup
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<Member> = None;
        let result = Self::session(ws_stream, addr, &rooms, &stats, &config, &mut member).await;

        // Cleanup: leave the room. Entity records outlive their peers.
        if let Some((user, project_id, group)) = member {
            group.remove_peer(&user.id).await;
            let _ = group.broadcast(&WireMessage::UserLeft { user_id: user.id }, Some(user.id));
            log::info!("{} left project {project_id}", user.name);
        }

        stats.write().await.active_connections -= 1;
        result
    }

    /// Pump one joined-or-joining connection until it ends.
    async fn session(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        rooms: &Rooms,
        stats: &RwLock<RelayStats>,
        config: &RelayConfig,
        member: &mut Option<Member>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut broadcast_rx: Option<broadcast::Receiver<Envelope>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let message = match WireMessage::decode(&bytes) {
                                Ok(message) => message,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            match message {
                                WireMessage::Hello { user, project_id } => {
                                    if member.is_some() {
                                        log::debug!("Duplicate hello from {addr}");
                                        continue;
                                    }

                                    let joined = Self::join(rooms, config, &user, project_id).await;
                                    let Some((rx, group, snapshot)) = joined else {
                                        log::warn!("Room {project_id} full; refusing {}", user.name);
                                        let _ = ws_sender.send(Message::Close(None)).await;
                                        break;
                                    };
                                    *member = Some((user.clone(), project_id, group.clone()));

                                    let frame = snapshot.encode()?;
                                    if let Err(e) = ws_sender.send(Message::Binary(frame.into())).await {
                                        log::debug!("Snapshot to {addr} failed: {e}");
                                        break;
                                    }
                                    let _ = group.broadcast(
                                        &WireMessage::UserJoined { user: user.clone() },
                                        Some(user.id),
                                    );

                                    {
                                        let active_rooms = rooms.read().await.len();
                                        stats.write().await.active_rooms = active_rooms;
                                    }
                                    log::info!("{} ({}) joined project {project_id}", user.name, user.id);

                                    broadcast_rx = Some(rx);
                                }

                                other => {
                                    let Some((user, project_id, group)) = member.as_ref() else {
                                        log::debug!("Ignoring {} from {addr} before hello", other.name());
                                        continue;
                                    };

                                    match other {
                                        WireMessage::EntityUpdate { entity_id, kind, changes, base_version } => {
                                            let updated = {
                                                let mut rooms_w = rooms.write().await;
                                                rooms_w
                                                    .get_mut(project_id)
                                                    .map(|room| room.apply(entity_id, kind, &changes, base_version, user))
                                            };

                                            if let Some(entity) = updated {
                                                log::trace!("Entity {entity_id} now v{}", entity.last_modified);
                                                stats.write().await.entity_updates += 1;
                                                let _ = group.broadcast(&WireMessage::EntityUpdated { entity }, None);
                                            }
                                        }

                                        // Peers only speak for themselves.
                                        WireMessage::PresenceUpdate { status, timestamp, .. } => {
                                            group.set_presence(&user.id, status, timestamp).await;
                                            let forward = WireMessage::PresenceUpdate { user_id: user.id, status, timestamp };
                                            let _ = group.broadcast(&forward, Some(user.id));
                                        }

                                        WireMessage::ActivityUpdate { entity_id, active, .. } => {
                                            let forward = WireMessage::ActivityUpdate { user_id: user.id, entity_id, active };
                                            let _ = group.broadcast(&forward, Some(user.id));
                                        }

                                        message => {
                                            log::debug!("Unhandled {} from {addr}", message.name());
                                        }
                                    }
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast frame
                envelope = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // Not joined yet; wait forever
                        std::future::pending().await
                    }
                } => {
                    match envelope {
                        Ok(envelope) => {
                            let Some((user, _, _)) = member.as_ref() else { continue };
                            if !envelope.is_for(user.id) {
                                continue;
                            }
                            if let Err(e) = ws_sender.send(Message::Binary(envelope.frame.to_vec().into())).await {
                                log::debug!("Send to {addr} failed: {e}");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer at {addr} lagged by {n} messages");
                            if let Some((_, _, group)) = member.as_ref() {
                                group.record_dropped(n);
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Register `user` in the room, creating it if needed.
    ///
    /// Returns `None` when the room is full.
    async fn join(
        rooms: &Rooms,
        config: &RelayConfig,
        user: &User,
        project_id: Uuid,
    ) -> Option<(broadcast::Receiver<Envelope>, Arc<BroadcastGroup>, WireMessage)> {
        // Subscribe under the room lock so no write lands between the
        // snapshot and the subscription.
        let mut rooms_w = rooms.write().await;
        let room = rooms_w
            .entry(project_id)
            .or_insert_with(|| ProjectRoom::new(config.broadcast_capacity));
        let group = room.broadcast.clone();

        if group.peer_count().await >= config.max_peers_per_room {
            return None;
        }

        let entities: Vec<Entity> = room.entities.values().cloned().collect();
        let users = group.peers().await;
        let rx = group.add_peer(user.clone()).await;
        Some((rx, group, WireMessage::Snapshot { entities, users }))
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Current entity records of a project room.
    pub async fn entities(&self, project_id: &Uuid) -> Vec<Entity> {
        self.rooms
            .read()
            .await
            .get(project_id)
            .map(|room| room.entities.values().cloned().collect())
            .unwrap_or_default()
    }
}
