//! Collaboration client: the one place that mutates local state.
//!
//! Provides:
//! - Connection lifecycle (start, shutdown, automatic reconnect)
//! - Optimistic entity mutation with conflict surfacing
//! - Presence heartbeats and peer timeouts
//! - "Who is editing" activity signals
//! - Offline queue for entity updates made while disconnected
//!
//! ```text
//!  UI calls ──────────────────────────┐
//!                                     ▼
//!  ConnectionManager ──bus──▶ inbox ──▶ CollabClient ──▶ EntityStore
//!        ▲                            │   │   │          PresenceRegistry
//!        └────────── emit ────────────┘   │   │          ActivityTracker
//!                            timers ──────┘   └──▶ ClientEvent
//! ```
//!
//! Bus handlers only forward into the inbox; all state changes happen
//! inside `&mut self` methods, so store updates never interleave.

use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::activity::{ActivityTracker, ActivityUpdate};
use crate::config::{CollabConfig, OfflinePolicy};
use crate::conflict::{ResolutionStrategy, ResolveError};
use crate::connection::{ConnectionManager, ConnectionState, EmitOutcome};
use crate::events::{ChannelEvent, EventKind, Subscription};
use crate::model::{
    now_millis, Conflict, ConflictId, Entity, EntityId, EntityKind, FieldMap, PresenceStatus,
    SyncState, User, UserId,
};
use crate::presence::{PresenceOutcome, PresenceRegistry};
use crate::protocol::WireMessage;
use crate::store::{EntityStore, RemoteOutcome};
use crate::transport::{Connector, WsConnector};

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connection(ConnectionState),
    EntityChanged { entity_id: EntityId, state: SyncState },
    /// A new conflict needs a resolution call.
    ConflictDetected(Conflict),
    /// An open conflict's remote side changed.
    ConflictUpdated(Conflict),
    PresenceChanged(User),
    ActivityChanged(ActivityUpdate),
}

/// Offline queue for entity updates made while disconnected.
///
/// Queued updates are replayed, in order, after the next `hello`.
pub struct OfflineQueue {
    queue: VecDeque<WireMessage>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, message: WireMessage) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(message);
        true
    }

    /// Put back updates that could not be sent, ahead of anything newer.
    pub fn requeue_front(&mut self, messages: Vec<WireMessage>) {
        for message in messages.into_iter().rev() {
            self.queue.push_front(message);
        }
    }

    /// Drain all queued updates for replay.
    pub fn drain(&mut self) -> Vec<WireMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// What woke the client loop.
enum Wake {
    Channel(ChannelEvent),
    PresenceExpired(User),
    ActivityExpired(ActivityUpdate),
    Heartbeat,
}

/// The collaboration client for one user in one project.
pub struct CollabClient<C: Connector> {
    config: CollabConfig,
    local_user: User,
    connection: ConnectionManager<C>,
    presence: PresenceRegistry,
    store: EntityStore,
    activity: ActivityTracker,
    offline_queue: OfflineQueue,
    inbox: mpsc::Receiver<ChannelEvent>,
    /// Bus routes feeding the inbox; dropped with the client.
    _routes: Vec<Subscription>,
    ready: VecDeque<ClientEvent>,
    heartbeat: Option<Interval>,
    /// `hello` sent on the current link.
    joined: bool,
}

impl CollabClient<WsConnector> {
    /// Client connecting over WebSocket to `config.server_url`.
    pub fn websocket(config: CollabConfig, local_user: User) -> Self {
        let connector = WsConnector::new(config.server_url.clone());
        Self::new(config, local_user, connector)
    }

    pub fn server_url(&self) -> &str {
        self.connection.connector().url()
    }
}

impl<C: Connector> CollabClient<C> {
    pub fn new(config: CollabConfig, local_user: User, connector: C) -> Self {
        let connection = ConnectionManager::new(connector, config.reconnect);

        let (inbox_tx, inbox) = mpsc::channel(config.inbox_capacity.max(1));
        let routes = EventKind::ALL
            .iter()
            .map(|kind| {
                let tx = inbox_tx.clone();
                connection.on(*kind, move |event| {
                    if let Err(e) = tx.try_send(event.clone()) {
                        log::warn!("Client inbox unavailable; dropping {:?}: {e}", event.kind());
                    }
                })
            })
            .collect();

        Self {
            presence: PresenceRegistry::new(local_user.id, config.presence_timeout),
            store: EntityStore::new(local_user.id),
            activity: ActivityTracker::new(config.activity_timeout),
            offline_queue: OfflineQueue::new(config.offline_queue_capacity),
            inbox,
            _routes: routes,
            ready: VecDeque::new(),
            heartbeat: None,
            joined: false,
            connection,
            local_user,
            config,
        }
    }

    /// Connect and start heartbeating. Must be called inside a tokio runtime.
    pub fn start(&mut self) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
        self.connection.connect();
    }

    /// Announce departure and close the connection.
    pub fn shutdown(&mut self) {
        if self.is_joined() {
            for update in self.activity.mark_inactive(self.local_user.id) {
                self.emit_activity(update);
            }
            self.local_user.status = PresenceStatus::Offline;
            self.local_user.last_seen = now_millis();
            self.emit_presence();
        }
        self.heartbeat = None;
        self.joined = false;
        self.connection.disconnect();
        self.presence.mark_offline(&self.local_user.id);
    }

    // ───────────────────────────────────────────────────────────────────
    // Entities
    // ───────────────────────────────────────────────────────────────────

    /// Apply a local change optimistically and send it.
    ///
    /// While the entity is conflicted the change is held for the
    /// resolution instead of being sent.
    pub fn mutate_entity(&mut self, entity_id: EntityId, changes: FieldMap) -> Entity {
        let conflicted = self.store.conflict_for(&entity_id).is_some();
        let entity = self.store.apply_local_mutation(entity_id, changes.clone());

        if !conflicted {
            let base_version = self
                .store
                .pending(&entity_id)
                .map(|p| p.base_version)
                .unwrap_or_default();
            self.send_entity_update(WireMessage::EntityUpdate {
                entity_id,
                kind: entity.kind,
                changes,
                base_version,
            });
        }

        self.push_entity_changed(entity_id);
        entity
    }

    /// Create an entity and send its initial fields.
    pub fn create_entity(&mut self, kind: EntityKind, fields: FieldMap) -> Entity {
        let entity = self.store.create_entity(kind, fields.clone());
        self.send_entity_update(WireMessage::EntityUpdate {
            entity_id: entity.id,
            kind,
            changes: fields,
            base_version: 0,
        });
        self.push_entity_changed(entity.id);
        entity
    }

    /// Settle a conflict and broadcast the result.
    ///
    /// `NotFound` means the conflict is already gone; treat it as resolved.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
    ) -> Result<Entity, ResolveError> {
        let resolved = self.store.resolve(conflict_id, strategy)?;
        self.send_entity_update(resolved.update);
        self.push_entity_changed(resolved.entity.id);
        Ok(resolved.entity)
    }

    pub fn entity(&self, entity_id: &EntityId) -> Option<Entity> {
        self.store.get_entity(entity_id)
    }

    pub fn sync_state(&self, entity_id: &EntityId) -> SyncState {
        self.store.state(entity_id)
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.store.conflicts().into_iter().cloned().collect()
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    // ───────────────────────────────────────────────────────────────────
    // Presence & activity
    // ───────────────────────────────────────────────────────────────────

    /// Be notified of every presence change, including timeouts.
    pub fn subscribe_presence<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&User) + Send + Sync + 'static,
    {
        self.presence.subscribe(callback)
    }

    /// Change the local user's status and announce it.
    pub fn set_status(&mut self, status: PresenceStatus) {
        self.local_user.status = status;
        self.local_user.last_seen = now_millis();
        self.presence.update_presence(self.local_user.clone());
        self.emit_presence();
    }

    /// Signal that the local user is editing `entity_id`.
    ///
    /// Sent on every call so that peers' expiry timers are refreshed.
    pub fn mark_active(&mut self, entity_id: EntityId) -> bool {
        let user_id = self.local_user.id;
        let started = self.activity.mark_active(user_id, entity_id);
        self.local_user.current_focus = Some(entity_id);
        self.presence.set_focus(&user_id, Some(entity_id));

        let update = ActivityUpdate {
            user_id,
            entity_id,
            active: true,
        };
        self.emit_activity(update);
        if started {
            self.ready.push_back(ClientEvent::ActivityChanged(update));
        }
        started
    }

    /// Clear the local user's editing signals.
    pub fn mark_inactive(&mut self) {
        let user_id = self.local_user.id;
        self.local_user.current_focus = None;
        self.presence.set_focus(&user_id, None);
        for update in self.activity.mark_inactive(user_id) {
            self.emit_activity(update);
            self.ready.push_back(ClientEvent::ActivityChanged(update));
        }
    }

    pub fn editors_of(&self, entity_id: &EntityId) -> Vec<UserId> {
        self.activity.editors_of(entity_id)
    }

    pub fn presence(&self, user_id: &UserId) -> Option<&User> {
        self.presence.get(user_id)
    }

    pub fn online_users(&self) -> Vec<User> {
        self.presence.online_users()
    }

    pub fn local_user(&self) -> &User {
        &self.local_user
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn offline_queue_len(&self) -> usize {
        self.offline_queue.len()
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    // ───────────────────────────────────────────────────────────────────
    // Event loop
    // ───────────────────────────────────────────────────────────────────

    /// Wait for and process the next channel event or timer, returning the
    /// next application-visible event.
    pub async fn next_event(&mut self) -> ClientEvent {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return event;
            }

            let wake = {
                let inbox = &mut self.inbox;
                let presence = &mut self.presence;
                let activity = &mut self.activity;
                let heartbeat = &mut self.heartbeat;

                tokio::select! {
                    Some(event) = inbox.recv() => Wake::Channel(event),
                    user = presence.next_expired() => Wake::PresenceExpired(user),
                    update = activity.next_expired() => Wake::ActivityExpired(update),
                    _ = async {
                        match heartbeat.as_mut() {
                            Some(interval) => interval.tick().await,
                            None => std::future::pending().await,
                        }
                    } => Wake::Heartbeat,
                }
            };

            match wake {
                Wake::Channel(event) => {
                    let events = self.handle_event(event);
                    self.ready.extend(events);
                }
                Wake::PresenceExpired(user) => {
                    self.activity_cleared(user.id);
                    self.ready.push_back(ClientEvent::PresenceChanged(user));
                }
                Wake::ActivityExpired(update) => {
                    if update.user_id == self.local_user.id {
                        self.emit_activity(update);
                    }
                    self.ready.push_back(ClientEvent::ActivityChanged(update));
                }
                Wake::Heartbeat => {
                    if self.is_joined() {
                        self.local_user.last_seen = now_millis();
                        self.emit_presence();
                        self.flush_offline_queue();
                    } else if self.connection.is_connected() {
                        // The connect notification never reached us.
                        log::debug!("Connected but not joined, sending hello");
                        if self.announce() {
                            self.ready.push_back(ClientEvent::Connection(ConnectionState::Connected));
                            self.ready
                                .push_back(ClientEvent::PresenceChanged(self.local_user.clone()));
                        }
                    }
                }
            }
        }
    }

    /// Apply one channel event to local state.
    pub fn handle_event(&mut self, event: ChannelEvent) -> Vec<ClientEvent> {
        match event {
            ChannelEvent::Connect => {
                self.announce();
                vec![
                    ClientEvent::Connection(ConnectionState::Connected),
                    ClientEvent::PresenceChanged(self.local_user.clone()),
                ]
            }
            ChannelEvent::Disconnect { reason } => {
                log::info!("Disconnected: {reason}");
                let mut events = vec![ClientEvent::Connection(ConnectionState::Disconnected)];
                events.extend(self.local_offline());
                events
            }
            ChannelEvent::ConnectError { attempt, error } => {
                log::debug!("Connect attempt {attempt} failed: {error}");
                self.local_offline().into_iter().collect()
            }
            ChannelEvent::ReconnectFailed { attempts } => {
                log::warn!("Reconnection abandoned after {attempts} attempts");
                let mut events = vec![ClientEvent::Connection(ConnectionState::Error)];
                events.extend(self.local_offline());
                events
            }
            ChannelEvent::Message(message) => self.handle_message(message),
        }
    }

    fn handle_message(&mut self, message: WireMessage) -> Vec<ClientEvent> {
        let local_id = self.local_user.id;
        match message {
            WireMessage::Snapshot { entities, users } => {
                log::debug!("Snapshot: {} entities, {} users", entities.len(), users.len());
                let mut events = Vec::new();
                for (entity_id, outcome) in self.store.seed(entities) {
                    events.extend(self.outcome_events(entity_id, outcome));
                }
                for user in users.into_iter().filter(|u| u.id != local_id) {
                    events.extend(self.presence_changed(user));
                }
                events
            }
            WireMessage::EntityUpdated { entity } => {
                let entity_id = entity.id;
                let outcome = self.store.apply_remote_update(entity);
                self.outcome_events(entity_id, outcome)
            }
            WireMessage::UserJoined { user } if user.id != local_id => {
                log::info!("{} joined", user.name);
                self.presence_changed(user).into_iter().collect()
            }
            WireMessage::UserLeft { user_id } if user_id != local_id => {
                let mut events: Vec<ClientEvent> = self
                    .presence
                    .mark_offline(&user_id)
                    .map(ClientEvent::PresenceChanged)
                    .into_iter()
                    .collect();
                events.extend(self.activity_cleared(user_id));
                events
            }
            WireMessage::PresenceUpdate {
                user_id,
                status,
                timestamp,
            } if user_id != local_id => {
                if self.presence.apply_status(user_id, status, timestamp) == PresenceOutcome::Stale {
                    return Vec::new();
                }
                let mut events: Vec<ClientEvent> = self
                    .presence
                    .get(&user_id)
                    .cloned()
                    .map(ClientEvent::PresenceChanged)
                    .into_iter()
                    .collect();
                if status == PresenceStatus::Offline {
                    events.extend(self.activity_cleared(user_id));
                }
                events
            }
            WireMessage::ActivityUpdate {
                user_id,
                entity_id,
                active,
            } if user_id != local_id => {
                let update = ActivityUpdate {
                    user_id,
                    entity_id,
                    active,
                };
                if self.activity.apply(update) {
                    vec![ClientEvent::ActivityChanged(update)]
                } else {
                    Vec::new()
                }
            }
            other => {
                log::trace!("Ignoring {}", other.name());
                Vec::new()
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Helpers
    // ───────────────────────────────────────────────────────────────────

    fn outcome_events(&self, entity_id: EntityId, outcome: RemoteOutcome) -> Vec<ClientEvent> {
        let conflict = |id: ConflictId| self.store.conflict(&id).cloned();
        match outcome {
            RemoteOutcome::Ignored => Vec::new(),
            RemoteOutcome::ConflictRaised(id) => conflict(id)
                .map(ClientEvent::ConflictDetected)
                .into_iter()
                .chain(std::iter::once(self.entity_changed(entity_id)))
                .collect(),
            RemoteOutcome::ConflictUpdated(id) => conflict(id)
                .map(ClientEvent::ConflictUpdated)
                .into_iter()
                .collect(),
            _ => vec![self.entity_changed(entity_id)],
        }
    }

    fn entity_changed(&self, entity_id: EntityId) -> ClientEvent {
        ClientEvent::EntityChanged {
            entity_id,
            state: self.store.state(&entity_id),
        }
    }

    fn push_entity_changed(&mut self, entity_id: EntityId) {
        let event = self.entity_changed(entity_id);
        self.ready.push_back(event);
    }

    fn presence_changed(&mut self, user: User) -> Option<ClientEvent> {
        let user_id = user.id;
        match self.presence.update_presence(user) {
            PresenceOutcome::Applied => self
                .presence
                .get(&user_id)
                .cloned()
                .map(ClientEvent::PresenceChanged),
            PresenceOutcome::Stale => None,
        }
    }

    fn activity_cleared(&mut self, user_id: UserId) -> Vec<ClientEvent> {
        self.activity
            .mark_inactive(user_id)
            .into_iter()
            .map(ClientEvent::ActivityChanged)
            .collect()
    }

    /// Go online and join the room. Returns whether the hello was sent.
    fn announce(&mut self) -> bool {
        self.local_user.status = PresenceStatus::Online;
        self.local_user.last_seen = now_millis();
        self.presence.update_presence(self.local_user.clone());

        let hello = WireMessage::Hello {
            user: self.local_user.clone(),
            project_id: self.config.project_id,
        };
        self.joined = self.connection.emit(&hello) == EmitOutcome::Sent;
        self.flush_offline_queue();
        self.joined
    }

    fn local_offline(&mut self) -> Option<ClientEvent> {
        self.joined = false;
        self.local_user.status = PresenceStatus::Offline;
        self.presence
            .mark_offline(&self.local_user.id)
            .map(ClientEvent::PresenceChanged)
    }

    fn send_entity_update(&mut self, message: WireMessage) {
        if self.is_joined() && self.connection.emit(&message) == EmitOutcome::Sent {
            return;
        }

        match self.config.offline_policy {
            OfflinePolicy::QueueAndFlush => {
                if !self.offline_queue.enqueue(message) {
                    log::warn!(
                        "Offline queue full ({}); dropping entity update",
                        self.offline_queue.len()
                    );
                }
            }
            OfflinePolicy::Drop => {
                log::warn!("Offline; dropping {}", message.name());
            }
        }
    }

    fn flush_offline_queue(&mut self) {
        if !self.is_joined() || self.offline_queue.is_empty() {
            return;
        }
        let queued = self.offline_queue.drain();
        log::info!("Replaying {} queued updates", queued.len());

        let mut remaining = queued.into_iter();
        while let Some(message) = remaining.next() {
            if self.connection.emit(&message) == EmitOutcome::Dropped {
                let mut unsent = vec![message];
                unsent.extend(remaining);
                log::debug!("{} queued updates deferred", unsent.len());
                self.offline_queue.requeue_front(unsent);
                return;
            }
        }
    }

    /// Connected and announced to the room.
    fn is_joined(&self) -> bool {
        self.joined && self.connection.is_connected()
    }

    /// Presence and activity are ephemeral; they are never queued.
    fn emit_presence(&self) {
        if !self.is_joined() {
            return;
        }
        self.connection.emit(&WireMessage::PresenceUpdate {
            user_id: self.local_user.id,
            status: self.local_user.status,
            timestamp: self.local_user.last_seen,
        });
    }

    fn emit_activity(&self, update: ActivityUpdate) {
        if !self.is_joined() {
            return;
        }
        self.connection.emit(&WireMessage::ActivityUpdate {
            user_id: update.user_id,
            entity_id: update.entity_id,
            active: update.active,
        });
    }
}
