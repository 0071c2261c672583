//! Conflict detection and resolution.
//!
//! Everything here is a pure function of its inputs; the
//! [`EntityStore`](crate::store::EntityStore) owns the state and decides
//! when to call in.
//!
//! A conflict exists when a remote update from another user changes a
//! field that a pending local mutation also changes, to a value different
//! from ours:
//!
//! ```text
//!   field    known-good   pending (local)   remote
//!   status   todo         in_progress       completed    ← divergent
//!   title    A            -                 B            ← remote only
//!   owner    kim          sam               sam          ← agrees, not divergent
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    Conflict, ConflictId, Entity, FieldMap, FieldValue, PendingMutation, ResolutionState,
    Timestamp, UserId,
};

/// How to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    /// Keep our pending fields, re-broadcast them under a new version.
    Local,
    /// Drop our pending fields and adopt the remote entity.
    Remote,
    /// Field-level union; fields changed on both sides take the local value.
    Merge,
}

/// Resolution failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveError {
    /// No open conflict has this id. Callers treat this as "already resolved".
    NotFound(ConflictId),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "Conflict not found: {id}"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Fields whose value in `remote` differs from `base`.
pub fn touched_fields(base: &Entity, remote: &Entity) -> FieldMap {
    remote
        .fields
        .iter()
        .filter(|(name, value)| base.fields.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Pending fields the remote changed to something other than our value.
pub fn divergent_fields(confirmed: &Entity, pending: &FieldMap, remote: &Entity) -> Vec<String> {
    pending
        .iter()
        .filter(|(name, ours)| {
            let theirs = remote.fields.get(*name);
            theirs != confirmed.fields.get(*name) && theirs != Some(*ours)
        })
        .map(|(name, _)| name.clone())
        .collect()
}

/// Decide whether `remote` conflicts with `pending`.
///
/// Echoes of our own writes (`modified_by == local_user`) never conflict.
pub fn detect(
    confirmed: &Entity,
    pending: &PendingMutation,
    remote: &Entity,
    local_user: UserId,
    now: Timestamp,
) -> Option<Conflict> {
    if remote.modified_by == local_user {
        return None;
    }
    if divergent_fields(confirmed, &pending.changes, remote).is_empty() {
        return None;
    }

    Some(Conflict {
        id: Uuid::new_v4(),
        entity_id: confirmed.id,
        local_changes: pending.changes.clone(),
        remote_changes: touched_fields(confirmed, remote),
        detected_at: now,
        resolution_state: ResolutionState::Pending,
        base_version: pending.base_version,
        remote_entity: remote.clone(),
    })
}

/// Union of two change sets. On a key present in both, `local` wins.
pub fn merge_changes(local: &FieldMap, remote: &FieldMap) -> FieldMap {
    let mut merged = remote.clone();
    for (name, value) in local {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

/// Outcome of applying a strategy to a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The new known-good entity.
    pub entity: Entity,
    /// Changes to re-broadcast so peers converge on `entity`.
    pub outbound: FieldMap,
    pub state: ResolutionState,
}

/// Compute the resolved entity for `conflict` against the local known-good
/// copy `confirmed`.
///
/// Local and merged results are stamped strictly newer than both sides so
/// the re-broadcast supersedes the remote version everywhere.
pub fn resolve_entity(
    conflict: &Conflict,
    confirmed: &Entity,
    strategy: ResolutionStrategy,
    local_user: UserId,
    now: Timestamp,
) -> Resolution {
    let remote = &conflict.remote_entity;
    let stamp = now
        .max(remote.last_modified + 1)
        .max(confirmed.last_modified + 1);

    match strategy {
        ResolutionStrategy::Local => {
            let mut entity = confirmed.clone();
            entity.apply_changes(&conflict.local_changes);
            entity.last_modified = stamp;
            entity.modified_by = local_user;

            // Undo remote-only fields on the authority as well.
            let mut outbound = conflict.local_changes.clone();
            for name in conflict.remote_changes.keys() {
                if !outbound.contains_key(name) {
                    let known = confirmed.fields.get(name).cloned().unwrap_or(FieldValue::Null);
                    outbound.insert(name.clone(), known);
                }
            }

            Resolution {
                entity,
                outbound,
                state: ResolutionState::ResolvedLocal,
            }
        }
        ResolutionStrategy::Remote => Resolution {
            entity: remote.clone(),
            outbound: conflict.remote_changes.clone(),
            state: ResolutionState::ResolvedRemote,
        },
        ResolutionStrategy::Merge => {
            let merged = merge_changes(&conflict.local_changes, &conflict.remote_changes);
            let mut entity = confirmed.clone();
            entity.apply_changes(&merged);
            entity.last_modified = stamp;
            entity.modified_by = local_user;

            Resolution {
                entity,
                outbound: merged,
                state: ResolutionState::ResolvedMerged,
            }
        }
    }
}
