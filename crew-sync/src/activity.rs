//! Ephemeral "who is editing what" tracking.
//!
//! An `(user, entity)` pair is active until it is cleared explicitly or its
//! inactivity timer fires. Refreshing an active pair only re-arms the timer.
//! Nothing here is persisted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::model::{EntityId, UserId};
use crate::timers::KeyedTimers;

/// One active/inactive transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityUpdate {
    pub user_id: UserId,
    pub entity_id: EntityId,
    pub active: bool,
}

pub struct ActivityTracker {
    /// entity → users editing it
    editors: HashMap<EntityId, BTreeSet<UserId>>,
    timeout: Duration,
    expiry: KeyedTimers<(UserId, EntityId)>,
}

impl ActivityTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            editors: HashMap::new(),
            timeout,
            expiry: KeyedTimers::new(),
        }
    }

    /// Mark `user_id` as editing `entity_id` and (re)arm the inactivity timer.
    ///
    /// Returns `true` when this is a new transition to active.
    pub fn mark_active(&mut self, user_id: UserId, entity_id: EntityId) -> bool {
        self.expiry.schedule((user_id, entity_id), self.timeout);
        self.editors.entry(entity_id).or_default().insert(user_id)
    }

    /// Clear every activity of `user_id` immediately.
    pub fn mark_inactive(&mut self, user_id: UserId) -> Vec<ActivityUpdate> {
        let entities: Vec<EntityId> = self
            .editors
            .iter()
            .filter(|(_, users)| users.contains(&user_id))
            .map(|(entity_id, _)| *entity_id)
            .collect();

        let mut cleared: Vec<ActivityUpdate> = entities
            .into_iter()
            .filter(|entity_id| self.clear(user_id, *entity_id))
            .map(|entity_id| ActivityUpdate {
                user_id,
                entity_id,
                active: false,
            })
            .collect();
        cleared.sort_by_key(|u| u.entity_id);
        cleared
    }

    /// Clear one `(user, entity)` pair. Returns whether it was active.
    pub fn mark_entity_inactive(&mut self, user_id: UserId, entity_id: EntityId) -> bool {
        self.clear(user_id, entity_id)
    }

    /// Apply a transition received from a peer.
    ///
    /// Returns `true` if local state changed.
    pub fn apply(&mut self, update: ActivityUpdate) -> bool {
        if update.active {
            self.mark_active(update.user_id, update.entity_id)
        } else {
            self.clear(update.user_id, update.entity_id)
        }
    }

    /// Users currently editing `entity_id`.
    pub fn editors_of(&self, entity_id: &EntityId) -> Vec<UserId> {
        self.editors
            .get(entity_id)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_active(&self, user_id: &UserId, entity_id: &EntityId) -> bool {
        self.editors
            .get(entity_id)
            .is_some_and(|users| users.contains(user_id))
    }

    /// Wait for the next inactivity timeout and return the resulting transition.
    pub async fn next_expired(&mut self) -> ActivityUpdate {
        loop {
            let (user_id, entity_id) = self.expiry.next_expired().await;
            if self.remove(user_id, entity_id) {
                log::debug!("Activity of {user_id} on {entity_id} expired");
                return ActivityUpdate {
                    user_id,
                    entity_id,
                    active: false,
                };
            }
        }
    }

    fn clear(&mut self, user_id: UserId, entity_id: EntityId) -> bool {
        self.expiry.cancel(&(user_id, entity_id));
        self.remove(user_id, entity_id)
    }

    fn remove(&mut self, user_id: UserId, entity_id: EntityId) -> bool {
        let Some(users) = self.editors.get_mut(&entity_id) else {
            return false;
        };
        let removed = users.remove(&user_id);
        if users.is_empty() {
            self.editors.remove(&entity_id);
        }
        removed
    }
}
