//! End-to-end client scenarios over in-memory links.
//!
//! The test plays the relay: it reads frames from each `MemoryPeer`,
//! applies entity writes to its own records and pushes `entity_updated`
//! back, in whatever order the scenario needs.

use std::collections::HashMap;
use std::time::Duration;

use crew_sync::client::{ClientEvent, CollabClient};
use crew_sync::config::{CollabConfig, OfflinePolicy};
use crew_sync::connection::{Backoff, ConnectionState};
use crew_sync::conflict::ResolutionStrategy;
use crew_sync::model::{fields, now_millis, Entity, EntityId, EntityKind, FieldValue, SyncState, User, UserId};
use crew_sync::protocol::WireMessage;
use crew_sync::transport::{MemoryConnector, MemoryPeer};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

/// Minimal stand-in for the relay's entity records.
#[derive(Default)]
struct Authority {
    entities: HashMap<EntityId, Entity>,
}

impl Authority {
    fn seed(&mut self, entity: Entity) {
        self.entities.insert(entity.id, entity);
    }

    /// Apply an `entity_update` and return the broadcast it produces.
    fn apply(&mut self, message: WireMessage, author: UserId) -> WireMessage {
        let WireMessage::EntityUpdate {
            entity_id,
            kind,
            changes,
            ..
        } = message
        else {
            panic!("Expected EntityUpdate, got {message:?}");
        };
        let record = self
            .entities
            .entry(entity_id)
            .or_insert_with(|| Entity::new(entity_id, kind, author));
        record.apply_changes(&changes);
        record.last_modified = now_millis().max(record.last_modified + 1);
        record.modified_by = author;
        WireMessage::EntityUpdated {
            entity: record.clone(),
        }
    }

    fn snapshot(&self) -> WireMessage {
        WireMessage::Snapshot {
            entities: self.entities.values().cloned().collect(),
            users: Vec::new(),
        }
    }
}

fn test_config(policy: OfflinePolicy) -> CollabConfig {
    CollabConfig {
        offline_policy: policy,
        reconnect: Backoff {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
        },
        ..CollabConfig::for_project("memory://", Uuid::new_v4())
    }
}

async fn recv(peer: &mut MemoryPeer) -> WireMessage {
    let frame = timeout(Duration::from_secs(1), peer.from_client.recv())
        .await
        .expect("Timed out waiting for a frame")
        .expect("Link closed");
    WireMessage::decode(&frame).unwrap()
}

async fn send(peer: &MemoryPeer, message: &WireMessage) {
    peer.to_client.send(message.encode().unwrap()).await.unwrap();
}

/// Process client events until it has been quiet for a moment.
async fn settle(client: &mut CollabClient<MemoryConnector>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = timeout(Duration::from_millis(100), client.next_event()).await {
        events.push(event);
    }
    events
}

/// Start a client, accept its link, check the hello and answer with a snapshot.
async fn join(
    name: &str,
    config: CollabConfig,
    authority: &Authority,
) -> (CollabClient<MemoryConnector>, MemoryPeer, mpsc::UnboundedReceiver<MemoryPeer>) {
    let (connector, mut accepted) = MemoryConnector::new();
    let mut client = CollabClient::new(config, User::new(name), connector);
    client.start();

    let mut peer = accepted.recv().await.unwrap();
    settle(&mut client).await;
    assert!(matches!(recv(&mut peer).await, WireMessage::Hello { .. }));

    send(&peer, &authority.snapshot()).await;
    settle(&mut client).await;
    (client, peer, accepted)
}

fn task(status: &str, by: UserId) -> Entity {
    Entity::new(Uuid::new_v4(), EntityKind::Task, by)
        .with_field("title", "Calibrate sensors")
        .with_field("status", status)
        .at_version(1_000)
}

fn text<'a>(entity: &'a Entity, field: &str) -> Option<&'a str> {
    entity.field(field).and_then(FieldValue::as_text)
}

#[tokio::test]
async fn test_concurrent_status_change_resolved_with_remote() {
    let other = User::new("Nog");
    let seeded = task("todo", other.id);
    let id = seeded.id;
    let mut authority = Authority::default();
    authority.seed(seeded);

    let (mut client, mut peer, _accepted) =
        join("Jake", test_config(OfflinePolicy::QueueAndFlush), &authority).await;
    assert_eq!(client.sync_state(&id), SyncState::Clean);

    client.mutate_entity(id, fields([("status", "in_progress")]));
    settle(&mut client).await;
    assert!(matches!(recv(&mut peer).await, WireMessage::EntityUpdate { .. }));

    // The other user's write reaches the relay first.
    let completed = authority.apply(
        WireMessage::EntityUpdate {
            entity_id: id,
            kind: EntityKind::Task,
            changes: fields([("status", "completed")]),
            base_version: 1_000,
        },
        other.id,
    );
    send(&peer, &completed).await;

    let events = settle(&mut client).await;
    let conflict = events
        .iter()
        .find_map(|e| match e {
            ClientEvent::ConflictDetected(c) => Some(c.clone()),
            _ => None,
        })
        .expect("conflict should be raised");
    assert!(conflict.local_changes.contains_key("status"));
    assert_eq!(client.sync_state(&id), SyncState::Conflicted);
    assert_eq!(client.conflicts().len(), 1);

    let resolved = client
        .resolve_conflict(conflict.id, ResolutionStrategy::Remote)
        .unwrap();
    assert_eq!(text(&resolved, "status"), Some("completed"));
    assert_eq!(client.sync_state(&id), SyncState::Clean);
    assert!(client.store().pending(&id).is_none());
    assert!(client.conflicts().is_empty());

    match recv(&mut peer).await {
        WireMessage::EntityUpdate { entity_id, changes, .. } => {
            assert_eq!(entity_id, id);
            assert_eq!(changes.get("status"), Some(&FieldValue::from("completed")));
        }
        other => panic!("Expected resolution update, got {other:?}"),
    }

    // Resolving twice reports the conflict as gone.
    assert!(client
        .resolve_conflict(conflict.id, ResolutionStrategy::Local)
        .is_err());
}

#[tokio::test]
async fn test_concurrent_status_change_resolved_with_local() {
    let other = User::new("Nog");
    let seeded = task("todo", other.id);
    let id = seeded.id;
    let mut authority = Authority::default();
    authority.seed(seeded);

    let (mut client, mut peer, _accepted) =
        join("Jake", test_config(OfflinePolicy::QueueAndFlush), &authority).await;

    client.mutate_entity(id, fields([("status", "in_progress")]));
    settle(&mut client).await;
    recv(&mut peer).await;

    let completed = authority.apply(
        WireMessage::EntityUpdate {
            entity_id: id,
            kind: EntityKind::Task,
            changes: fields([("status", "completed")]),
            base_version: 1_000,
        },
        other.id,
    );
    send(&peer, &completed).await;
    settle(&mut client).await;

    let conflict_id = client.conflicts()[0].id;
    let resolved = client
        .resolve_conflict(conflict_id, ResolutionStrategy::Local)
        .unwrap();
    assert_eq!(text(&resolved, "status"), Some("in_progress"));

    // The resolution write wins at the relay and comes back as an echo.
    let update = recv(&mut peer).await;
    let echo = authority.apply(update, client.local_user().id);
    send(&peer, &echo).await;
    settle(&mut client).await;

    let entity = client.entity(&id).unwrap();
    assert_eq!(text(&entity, "status"), Some("in_progress"));
    assert_eq!(client.sync_state(&id), SyncState::Clean);
}

#[tokio::test]
async fn test_own_echo_after_conflicting_write_keeps_conflict() {
    let other = User::new("Nog");
    let seeded = task("todo", other.id);
    let id = seeded.id;
    let mut authority = Authority::default();
    authority.seed(seeded);

    let (mut client, mut peer, _accepted) =
        join("Jake", test_config(OfflinePolicy::QueueAndFlush), &authority).await;

    client.mutate_entity(id, fields([("status", "in_progress")]));
    settle(&mut client).await;
    let ours = recv(&mut peer).await;

    // The relay takes the other write first, then ours, and echoes both.
    let completed = authority.apply(
        WireMessage::EntityUpdate {
            entity_id: id,
            kind: EntityKind::Task,
            changes: fields([("status", "completed")]),
            base_version: 1_000,
        },
        other.id,
    );
    let echo = authority.apply(ours, client.local_user().id);
    send(&peer, &completed).await;
    send(&peer, &echo).await;
    settle(&mut client).await;

    let conflicts = client.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(
        conflicts[0].remote_changes.get("status"),
        Some(&FieldValue::from("completed"))
    );
    assert_eq!(conflicts[0].remote_entity.modified_by, other.id);

    let resolved = client
        .resolve_conflict(conflicts[0].id, ResolutionStrategy::Remote)
        .unwrap();
    assert_eq!(text(&resolved, "status"), Some("completed"));
    match recv(&mut peer).await {
        WireMessage::EntityUpdate { changes, .. } => {
            assert_eq!(changes.get("status"), Some(&FieldValue::from("completed")));
        }
        other => panic!("Expected resolution update, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disjoint_field_edits_converge() {
    let seed_author = Uuid::new_v4();
    let seeded = task("todo", seed_author).with_field("priority", "low");
    let id = seeded.id;
    let mut authority = Authority::default();
    authority.seed(seeded);

    let config = test_config(OfflinePolicy::QueueAndFlush);
    let (mut alice, mut alice_peer, _a) = join("Alice", config.clone(), &authority).await;
    let (mut bob, mut bob_peer, _b) = join("Bob", config, &authority).await;

    alice.mutate_entity(id, fields([("title", "Recalibrate sensors")]));
    bob.mutate_entity(id, fields([("priority", "high")]));
    settle(&mut alice).await;
    settle(&mut bob).await;

    let from_alice = recv(&mut alice_peer).await;
    let from_bob = recv(&mut bob_peer).await;
    let first = authority.apply(from_alice, alice.local_user().id);
    let second = authority.apply(from_bob, bob.local_user().id);

    for broadcast in [&first, &second] {
        send(&alice_peer, broadcast).await;
        send(&bob_peer, broadcast).await;
    }
    let alice_events = settle(&mut alice).await;
    let bob_events = settle(&mut bob).await;

    assert!(!alice_events
        .iter()
        .any(|e| matches!(e, ClientEvent::ConflictDetected(_))));
    assert!(!bob_events
        .iter()
        .any(|e| matches!(e, ClientEvent::ConflictDetected(_))));

    let a = alice.entity(&id).unwrap();
    let b = bob.entity(&id).unwrap();
    assert_eq!(a.fields, b.fields);
    assert_eq!(text(&a, "title"), Some("Recalibrate sensors"));
    assert_eq!(text(&a, "priority"), Some("high"));
    assert_eq!(alice.sync_state(&id), SyncState::Clean);
    assert_eq!(bob.sync_state(&id), SyncState::Clean);
}

#[tokio::test]
async fn test_remote_write_under_pending_mutation_is_merged() {
    let seeded = task("todo", Uuid::new_v4());
    let id = seeded.id;
    let mut authority = Authority::default();
    authority.seed(seeded);

    let (mut client, mut peer, _accepted) =
        join("Alice", test_config(OfflinePolicy::QueueAndFlush), &authority).await;

    client.mutate_entity(id, fields([("status", "in_progress")]));
    settle(&mut client).await;
    let ours = recv(&mut peer).await;

    let theirs = authority.apply(
        WireMessage::EntityUpdate {
            entity_id: id,
            kind: EntityKind::Task,
            changes: fields([("title", "Calibrate deflector")]),
            base_version: 1_000,
        },
        Uuid::new_v4(),
    );
    send(&peer, &theirs).await;
    settle(&mut client).await;

    assert_eq!(client.sync_state(&id), SyncState::Merged);
    let view = client.entity(&id).unwrap();
    assert_eq!(text(&view, "title"), Some("Calibrate deflector"));
    assert_eq!(text(&view, "status"), Some("in_progress"));

    let echo = authority.apply(ours, client.local_user().id);
    send(&peer, &echo).await;
    settle(&mut client).await;
    assert_eq!(client.sync_state(&id), SyncState::Clean);
}

#[tokio::test]
async fn test_own_echo_acknowledges_created_entity() {
    let mut authority = Authority::default();
    let (mut client, mut peer, _accepted) =
        join("Kasidy", test_config(OfflinePolicy::QueueAndFlush), &authority).await;

    let created = client.create_entity(EntityKind::Project, fields([("name", "Freighter run")]));
    assert_eq!(client.sync_state(&created.id), SyncState::Pending);
    settle(&mut client).await;

    let update = recv(&mut peer).await;
    let echo = authority.apply(update, client.local_user().id);
    send(&peer, &echo).await;

    let events = settle(&mut client).await;
    assert!(events.contains(&ClientEvent::EntityChanged {
        entity_id: created.id,
        state: SyncState::Clean,
    }));
    assert!(client.store().pending(&created.id).is_none());
    assert_eq!(client.entity(&created.id).unwrap().kind, EntityKind::Project);
}

#[tokio::test]
async fn test_offline_edits_flush_after_hello() {
    let (connector, mut accepted) = MemoryConnector::new();
    let mut client = CollabClient::new(
        test_config(OfflinePolicy::QueueAndFlush),
        User::new("Rom"),
        connector,
    );

    let id = Uuid::new_v4();
    client.mutate_entity(id, fields([("status", "in_progress")]));
    client.mutate_entity(Uuid::new_v4(), fields([("status", "blocked")]));
    assert_eq!(client.offline_queue_len(), 2);

    client.start();
    let mut peer = accepted.recv().await.unwrap();
    settle(&mut client).await;

    assert!(matches!(recv(&mut peer).await, WireMessage::Hello { .. }));
    match recv(&mut peer).await {
        WireMessage::EntityUpdate { entity_id, .. } => assert_eq!(entity_id, id),
        other => panic!("Expected queued update, got {other:?}"),
    }
    assert!(matches!(recv(&mut peer).await, WireMessage::EntityUpdate { .. }));
    assert_eq!(client.offline_queue_len(), 0);
}

#[tokio::test]
async fn test_offline_edits_dropped_by_policy() {
    let (connector, mut accepted) = MemoryConnector::new();
    let mut client = CollabClient::new(test_config(OfflinePolicy::Drop), User::new("Leeta"), connector);

    let id = Uuid::new_v4();
    client.mutate_entity(id, fields([("status", "in_progress")]));
    assert_eq!(client.offline_queue_len(), 0);

    client.start();
    let mut peer = accepted.recv().await.unwrap();
    settle(&mut client).await;

    assert!(matches!(recv(&mut peer).await, WireMessage::Hello { .. }));
    let nothing = timeout(Duration::from_millis(200), peer.from_client.recv()).await;
    assert!(nothing.is_err());
    // The optimistic copy is still there, just never sent.
    assert_eq!(client.sync_state(&id), SyncState::Pending);
}

#[tokio::test]
async fn test_reconnect_rejoins_and_flushes() {
    let authority = Authority::default();
    let (mut client, peer, mut accepted) =
        join("Garak", test_config(OfflinePolicy::QueueAndFlush), &authority).await;

    peer.close();
    let events = settle(&mut client).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::Connection(s) if *s != ConnectionState::Connected)));

    // Edit during the outage; the backoff is short so this races the
    // reconnect, which is fine either way.
    let id = Uuid::new_v4();
    client.mutate_entity(id, fields([("status", "tailoring")]));

    let mut peer = timeout(Duration::from_secs(1), accepted.recv())
        .await
        .unwrap()
        .unwrap();
    settle(&mut client).await;
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    let mut saw_hello = false;
    let mut saw_update = false;
    while !(saw_hello && saw_update) {
        match recv(&mut peer).await {
            WireMessage::Hello { user, .. } => {
                assert_eq!(user.id, client.local_user().id);
                saw_hello = true;
            }
            WireMessage::EntityUpdate { entity_id, .. } => {
                assert!(saw_hello, "entity update sent before hello");
                assert_eq!(entity_id, id);
                saw_update = true;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let (connector, _accepted) = MemoryConnector::new();
    connector.fail_next(10);
    let mut config = test_config(OfflinePolicy::QueueAndFlush);
    config.reconnect.max_attempts = 3;
    let mut client = CollabClient::new(config, User::new("Brunt"), connector.clone());
    client.start();

    let events = settle(&mut client).await;
    assert!(events.contains(&ClientEvent::Connection(ConnectionState::Error)));
    assert_eq!(connector.attempts(), 3);
    assert_eq!(client.connection_state(), ConnectionState::Error);
}

#[tokio::test]
async fn test_peer_presence_and_activity_from_relay() {
    let authority = Authority::default();
    let (mut client, peer, _accepted) =
        join("Worf", test_config(OfflinePolicy::QueueAndFlush), &authority).await;

    let martok = User::new("Martok");
    send(&peer, &WireMessage::UserJoined { user: martok.clone() }).await;
    let entity_id = Uuid::new_v4();
    send(
        &peer,
        &WireMessage::ActivityUpdate {
            user_id: martok.id,
            entity_id,
            active: true,
        },
    )
    .await;
    settle(&mut client).await;

    assert!(client.online_users().iter().any(|u| u.id == martok.id));
    assert_eq!(client.editors_of(&entity_id), vec![martok.id]);

    send(&peer, &WireMessage::UserLeft { user_id: martok.id }).await;
    settle(&mut client).await;
    assert!(!client.online_users().iter().any(|u| u.id == martok.id));
    assert!(client.editors_of(&entity_id).is_empty());
}
