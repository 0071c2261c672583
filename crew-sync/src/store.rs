//! Local entity cache with optimistic mutation and remote merge.
//!
//! Each entity keeps a *known-good* copy (the last authoritative version we
//! accepted) plus at most one pending local mutation and at most one open
//! conflict:
//!
//! ```text
//!            apply_local_mutation
//!   Clean ───────────────────────▶ Pending ──ack──▶ Clean
//!                                   │   │
//!             remote, other fields  │   │ remote, divergent field
//!                                   ▼   ▼
//!                              Merged   Conflicted ──resolve──▶ Clean
//! ```
//!
//! Remote updates are evaluated in order:
//!
//! 1. no pending mutation: overwrite the known-good copy (older versions are
//!    ignored so `last_modified` never goes backwards);
//! 2. pending and the remote predates our base: stale, fill in fields we do
//!    not have and keep everything else;
//! 3. pending and the remote changes a pending field differently: conflict,
//!    the pending mutation moves into the conflict record.
//!
//! A remote that reflects every pending value acknowledges the mutation.

use std::collections::HashMap;

use crate::conflict::{self, ResolutionStrategy, ResolveError};
use crate::model::{
    now_millis, Conflict, ConflictId, Entity, EntityId, EntityKind, FieldMap, PendingMutation,
    SyncState, Timestamp, UserId,
};
use crate::protocol::WireMessage;

/// What `apply_remote_update` did with an incoming entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// New entity or plain overwrite of the known-good copy.
    Applied,
    /// Duplicate or out-of-order; nothing changed.
    Ignored,
    /// Older than the pending mutation's base; only missing fields were taken.
    StaleMerged,
    /// Adopted as known-good underneath a still-pending mutation.
    Merged,
    /// The remote reflects every pending value; the mutation is cleared.
    Acknowledged,
    ConflictRaised(ConflictId),
    /// The open conflict's remote side was replaced.
    ConflictUpdated(ConflictId),
    /// Non-conflicting fields taken while the conflict stays open.
    Absorbed(ConflictId),
}

/// A settled conflict and the update to broadcast for it.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub conflict: Conflict,
    pub entity: Entity,
    pub update: WireMessage,
}

struct Slot {
    confirmed: Entity,
    pending: Option<PendingMutation>,
    tentative_version: Timestamp,
    /// A remote update was adopted while the mutation was pending.
    merged: bool,
}

impl Slot {
    fn new(confirmed: Entity) -> Self {
        Self {
            confirmed,
            pending: None,
            tentative_version: 0,
            merged: false,
        }
    }

    /// Known-good copy with pending changes applied.
    fn optimistic(&self) -> Entity {
        let mut view = self.confirmed.clone();
        if let Some(pending) = &self.pending {
            view.apply_changes(&pending.changes);
            view.last_modified = self.tentative_version;
        }
        view
    }
}

pub struct EntityStore {
    local_user: UserId,
    slots: HashMap<EntityId, Slot>,
    /// Open conflicts, one per entity at most.
    conflicts: HashMap<EntityId, Conflict>,
    conflict_index: HashMap<ConflictId, EntityId>,
}

impl EntityStore {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            slots: HashMap::new(),
            conflicts: HashMap::new(),
            conflict_index: HashMap::new(),
        }
    }

    /// Load an initial snapshot. Entities go through the normal remote
    /// rules, so pending local work survives.
    pub fn seed(&mut self, entities: Vec<Entity>) -> Vec<(EntityId, RemoteOutcome)> {
        entities
            .into_iter()
            .map(|entity| {
                let id = entity.id;
                (id, self.apply_remote_update(entity))
            })
            .collect()
    }

    /// Create a new entity locally. Its fields are pending until echoed.
    pub fn create_entity(&mut self, kind: EntityKind, changes: FieldMap) -> Entity {
        let id = uuid::Uuid::new_v4();
        self.slots
            .insert(id, Slot::new(Entity::new(id, kind, self.local_user)));
        self.apply_local_mutation(id, changes)
    }

    /// Apply a local change optimistically and return the tentative entity.
    ///
    /// Changes to the same entity accumulate field by field in one pending
    /// mutation that keeps the base version of the first change. While a
    /// conflict is open, changes are added to the conflict's local side
    /// instead; they travel with its resolution.
    pub fn apply_local_mutation(&mut self, entity_id: EntityId, changes: FieldMap) -> Entity {
        let local_user = self.local_user;
        let slot = self.slots.entry(entity_id).or_insert_with(|| {
            Slot::new(Entity::new(entity_id, EntityKind::default(), local_user))
        });

        if let Some(conflict) = self.conflicts.get_mut(&entity_id) {
            for (name, value) in &changes {
                conflict.local_changes.insert(name.clone(), value.clone());
            }
            log::debug!(
                "Entity {entity_id} is conflicted; holding {} field(s) for resolution",
                changes.len()
            );
            let mut preview = slot.confirmed.clone();
            preview.apply_changes(&conflict.local_changes);
            return preview;
        }

        let now = now_millis();
        match &mut slot.pending {
            Some(pending) => {
                for (name, value) in changes {
                    pending.changes.insert(name, value);
                }
                pending.local_timestamp = now;
            }
            None => {
                slot.pending = Some(PendingMutation {
                    entity_id,
                    changes,
                    base_version: slot.confirmed.last_modified,
                    local_timestamp: now,
                });
                slot.merged = false;
            }
        }
        slot.tentative_version = now.max(slot.confirmed.last_modified);

        slot.optimistic()
    }

    /// Merge an authoritative entity broadcast into the cache.
    pub fn apply_remote_update(&mut self, remote: Entity) -> RemoteOutcome {
        let entity_id = remote.id;
        let Some(slot) = self.slots.get_mut(&entity_id) else {
            log::trace!("New entity {entity_id} v{}", remote.last_modified);
            self.slots.insert(entity_id, Slot::new(remote));
            return RemoteOutcome::Applied;
        };

        if let Some(open) = self.conflicts.get_mut(&entity_id) {
            if remote.last_modified < open.remote_entity.last_modified {
                return RemoteOutcome::Ignored;
            }

            let disagrees = remote.modified_by != self.local_user
                && open
                    .local_changes
                    .iter()
                    .any(|(name, ours)| remote.fields.get(name) != Some(ours));
            if disagrees {
                open.remote_changes = conflict::touched_fields(&slot.confirmed, &remote);
                open.remote_entity = remote;
                log::debug!("Conflict {} on {entity_id}: remote side replaced", open.id);
                return RemoteOutcome::ConflictUpdated(open.id);
            }

            // Our own echo, or a write agreeing with ours: both sides of the
            // conflict stand, only untouched fields are taken.
            if remote.last_modified == open.remote_entity.last_modified {
                return RemoteOutcome::Ignored;
            }
            for (name, value) in &remote.fields {
                if open.local_changes.contains_key(name) || open.remote_changes.contains_key(name) {
                    continue;
                }
                slot.confirmed.fields.insert(name.clone(), value.clone());
                open.remote_entity.fields.insert(name.clone(), value.clone());
            }
            open.remote_entity.last_modified = remote.last_modified;
            log::debug!(
                "Conflict {} on {entity_id}: absorbed v{} by {}",
                open.id,
                remote.last_modified,
                remote.modified_by
            );
            return RemoteOutcome::Absorbed(open.id);
        }

        let is_duplicate = remote.last_modified == slot.confirmed.last_modified
            && remote.fields == slot.confirmed.fields;

        let Some(pending) = &slot.pending else {
            if remote.last_modified < slot.confirmed.last_modified || is_duplicate {
                log::trace!(
                    "Ignoring out-of-order v{} for {entity_id} (have v{})",
                    remote.last_modified,
                    slot.confirmed.last_modified
                );
                return RemoteOutcome::Ignored;
            }
            slot.confirmed = remote;
            return RemoteOutcome::Applied;
        };

        let base = pending.base_version.max(slot.confirmed.last_modified);
        if remote.last_modified < base {
            log::warn!(
                "StaleWriteWarning: entity {entity_id} remote v{} predates local base v{base}",
                remote.last_modified
            );
            for (name, value) in &remote.fields {
                if !slot.confirmed.fields.contains_key(name) && !pending.changes.contains_key(name)
                {
                    slot.confirmed.fields.insert(name.clone(), value.clone());
                }
            }
            return RemoteOutcome::StaleMerged;
        }

        if is_duplicate {
            return RemoteOutcome::Ignored;
        }

        if let Some(found) =
            conflict::detect(&slot.confirmed, pending, &remote, self.local_user, now_millis())
        {
            log::info!(
                "Conflict {} on entity {entity_id}: local {:?} vs remote {:?}",
                found.id,
                found.local_changes.keys().collect::<Vec<_>>(),
                found.remote_changes.keys().collect::<Vec<_>>()
            );
            let id = found.id;
            slot.pending = None;
            slot.merged = false;
            self.conflict_index.insert(id, entity_id);
            self.conflicts.insert(entity_id, found);
            return RemoteOutcome::ConflictRaised(id);
        }

        let acknowledged = pending
            .changes
            .iter()
            .all(|(name, value)| remote.fields.get(name) == Some(value));
        slot.confirmed = remote;
        if acknowledged {
            slot.pending = None;
            slot.merged = false;
            RemoteOutcome::Acknowledged
        } else {
            slot.merged = true;
            slot.tentative_version = slot.tentative_version.max(slot.confirmed.last_modified);
            RemoteOutcome::Merged
        }
    }

    /// Settle an open conflict.
    ///
    /// Clears the pending state, installs the resolved entity as known-good
    /// and returns the update peers need to converge.
    pub fn resolve(
        &mut self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
    ) -> Result<Resolved, ResolveError> {
        let entity_id = self
            .conflict_index
            .remove(&conflict_id)
            .ok_or(ResolveError::NotFound(conflict_id))?;
        let mut settled = self
            .conflicts
            .remove(&entity_id)
            .ok_or(ResolveError::NotFound(conflict_id))?;
        let slot = self
            .slots
            .get_mut(&entity_id)
            .ok_or(ResolveError::NotFound(conflict_id))?;

        let resolution = conflict::resolve_entity(
            &settled,
            &slot.confirmed,
            strategy,
            self.local_user,
            now_millis(),
        );
        settled.resolution_state = resolution.state;

        slot.confirmed = resolution.entity.clone();
        slot.pending = None;
        slot.merged = false;

        log::info!("Conflict {conflict_id} on {entity_id} resolved ({strategy:?})");

        let update = WireMessage::EntityUpdate {
            entity_id,
            kind: resolution.entity.kind,
            changes: resolution.outbound,
            base_version: settled.remote_entity.last_modified,
        };
        Ok(Resolved {
            conflict: settled,
            entity: resolution.entity,
            update,
        })
    }

    /// Optimistic view if a mutation is pending, known-good otherwise.
    ///
    /// A conflicted entity shows its known-good copy until resolved.
    pub fn get_entity(&self, entity_id: &EntityId) -> Option<Entity> {
        let slot = self.slots.get(entity_id)?;
        if self.conflicts.contains_key(entity_id) {
            return Some(slot.confirmed.clone());
        }
        Some(slot.optimistic())
    }

    /// Last authoritative version accepted for an entity.
    pub fn known_good(&self, entity_id: &EntityId) -> Option<&Entity> {
        self.slots.get(entity_id).map(|s| &s.confirmed)
    }

    pub fn pending(&self, entity_id: &EntityId) -> Option<&PendingMutation> {
        self.slots.get(entity_id)?.pending.as_ref()
    }

    pub fn state(&self, entity_id: &EntityId) -> SyncState {
        if self.conflicts.contains_key(entity_id) {
            return SyncState::Conflicted;
        }
        match self.slots.get(entity_id) {
            Some(slot) if slot.pending.is_some() && slot.merged => SyncState::Merged,
            Some(slot) if slot.pending.is_some() => SyncState::Pending,
            _ => SyncState::Clean,
        }
    }

    pub fn conflict(&self, conflict_id: &ConflictId) -> Option<&Conflict> {
        let entity_id = self.conflict_index.get(conflict_id)?;
        self.conflicts.get(entity_id)
    }

    pub fn conflict_for(&self, entity_id: &EntityId) -> Option<&Conflict> {
        self.conflicts.get(entity_id)
    }

    /// Open conflicts, oldest first.
    pub fn conflicts(&self) -> Vec<&Conflict> {
        let mut open: Vec<&Conflict> = self.conflicts.values().collect();
        open.sort_by_key(|c| (c.detected_at, c.id));
        open
    }

    pub fn kind_of(&self, entity_id: &EntityId) -> EntityKind {
        self.slots
            .get(entity_id)
            .map(|s| s.confirmed.kind)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }
}
