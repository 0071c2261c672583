//! Presence registry: who is online, away or gone.
//!
//! ## Architecture
//!
//! ```text
//! presence_update / user_joined / snapshot
//!       │
//!       ▼
//! PresenceRegistry::update_presence()   (last-write-wins on last_seen)
//!       │                 │
//!       │                 └──▶ expiry timer re-armed (cancel-and-replace)
//!       ▼
//! subscribers notified
//!
//! no heartbeat within `timeout`
//!       │
//!       ▼
//! PresenceRegistry::next_expired()  →  user marked offline, subscribers notified
//! ```
//!
//! Peers re-announce themselves every heartbeat interval; a peer that stays
//! silent longer than the timeout is marked offline. The local user is never
//! timed out by its own registry.

use std::collections::HashMap;
use std::time::Duration;

use crate::events::{Subscribers, Subscription};
use crate::model::{EntityId, PresenceStatus, Timestamp, User, UserId};
use crate::timers::KeyedTimers;

/// Result of feeding a presence record to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOutcome {
    Applied,
    /// Older than the stored record; discarded.
    Stale,
}

pub struct PresenceRegistry {
    local_user_id: UserId,
    users: HashMap<UserId, User>,
    timeout: Duration,
    expiry: KeyedTimers<UserId>,
    listeners: Subscribers<User>,
}

impl PresenceRegistry {
    pub fn new(local_user_id: UserId, timeout: Duration) -> Self {
        Self {
            local_user_id,
            users: HashMap::new(),
            timeout,
            expiry: KeyedTimers::new(),
            listeners: Subscribers::new(),
        }
    }

    /// Upsert a user's presence.
    ///
    /// Records older than the stored `last_seen` are discarded; equal
    /// timestamps re-apply, so replays are harmless. Re-arms the user's
    /// expiry timer unless the user is local or offline.
    pub fn update_presence(&mut self, user: User) -> PresenceOutcome {
        if let Some(known) = self.users.get(&user.id) {
            if user.last_seen < known.last_seen {
                log::debug!(
                    "Discarding stale presence for {} ({} < {})",
                    user.id,
                    user.last_seen,
                    known.last_seen
                );
                return PresenceOutcome::Stale;
            }
        }

        if user.id != self.local_user_id && user.status != PresenceStatus::Offline {
            self.expiry.schedule(user.id, self.timeout);
        } else {
            self.expiry.cancel(&user.id);
        }

        self.listeners.publish(&user);
        self.users.insert(user.id, user);
        PresenceOutcome::Applied
    }

    /// Apply a bare status announcement.
    ///
    /// A status for a user we have never seen creates a placeholder record;
    /// they might have joined before we connected.
    pub fn apply_status(
        &mut self,
        user_id: UserId,
        status: PresenceStatus,
        timestamp: Timestamp,
    ) -> PresenceOutcome {
        let mut user = match self.users.get(&user_id) {
            Some(known) => known.clone(),
            None => User {
                id: user_id,
                name: format!("Peer-{}", &user_id.to_string()[..8]),
                status,
                last_seen: timestamp,
                current_focus: None,
            },
        };
        user.status = status;
        user.last_seen = timestamp;
        self.update_presence(user)
    }

    /// Last-known presence of a user.
    pub fn get(&self, user_id: &UserId) -> Option<&User> {
        self.users.get(user_id)
    }

    /// Mark a user offline now (left the room or timed out).
    ///
    /// Returns the updated record if the status changed.
    pub fn mark_offline(&mut self, user_id: &UserId) -> Option<User> {
        self.expiry.cancel(user_id);
        let user = self.users.get_mut(user_id)?;
        if user.status == PresenceStatus::Offline {
            return None;
        }
        user.status = PresenceStatus::Offline;
        user.current_focus = None;
        let user = user.clone();
        self.listeners.publish(&user);
        Some(user)
    }

    /// Set the focus of a known user. Not broadcast by itself.
    pub fn set_focus(&mut self, user_id: &UserId, focus: Option<EntityId>) {
        if let Some(user) = self.users.get_mut(user_id) {
            user.current_focus = focus;
        }
    }

    /// Wait for the next heartbeat timeout and return the user it took offline.
    pub async fn next_expired(&mut self) -> User {
        loop {
            let user_id = self.expiry.next_expired().await;
            if let Some(user) = self.mark_offline(&user_id) {
                log::info!("Presence timeout for {} ({})", user.name, user.id);
                return user;
            }
        }
    }

    /// Be notified of every applied presence change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&User) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    /// Users currently online, ordered by name.
    pub fn online_users(&self) -> Vec<User> {
        let mut online: Vec<User> = self
            .users
            .values()
            .filter(|u| u.is_online())
            .cloned()
            .collect();
        online.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        online
    }

    /// Users with a live expiry timer.
    pub fn tracked(&self) -> usize {
        self.expiry.len()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn local_user_id(&self) -> UserId {
        self.local_user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;
    use uuid::Uuid;

    const TIMEOUT: Duration = Duration::from_secs(45);

    fn user_at(id: UserId, name: &str, status: PresenceStatus, last_seen: Timestamp) -> User {
        User {
            id,
            name: name.into(),
            status,
            last_seen,
            current_focus: None,
        }
    }

    #[tokio::test]
    async fn test_update_and_get() {
        let mut registry = PresenceRegistry::new(Uuid::new_v4(), TIMEOUT);
        let id = Uuid::new_v4();
        assert!(registry.get(&id).is_none());

        let outcome = registry.update_presence(user_at(id, "Geordi", PresenceStatus::Online, 10));
        assert_eq!(outcome, PresenceOutcome::Applied);
        assert_eq!(registry.get(&id).unwrap().name, "Geordi");
        assert_eq!(registry.tracked(), 1);
    }

    #[tokio::test]
    async fn test_older_update_is_discarded() {
        let mut registry = PresenceRegistry::new(Uuid::new_v4(), TIMEOUT);
        let id = Uuid::new_v4();
        registry.update_presence(user_at(id, "Data", PresenceStatus::Away, 20));

        let outcome = registry.update_presence(user_at(id, "Data", PresenceStatus::Online, 19));
        assert_eq!(outcome, PresenceOutcome::Stale);
        assert_eq!(registry.get(&id).unwrap().status, PresenceStatus::Away);
        assert_eq!(registry.get(&id).unwrap().last_seen, 20);
    }

    #[tokio::test]
    async fn test_equal_timestamp_reapplies() {
        let mut registry = PresenceRegistry::new(Uuid::new_v4(), TIMEOUT);
        let id = Uuid::new_v4();
        registry.update_presence(user_at(id, "Data", PresenceStatus::Online, 20));
        let outcome = registry.update_presence(user_at(id, "Data", PresenceStatus::Away, 20));
        assert_eq!(outcome, PresenceOutcome::Applied);
        assert_eq!(registry.get(&id).unwrap().status, PresenceStatus::Away);
    }

    #[tokio::test]
    async fn test_monotonic_last_seen_under_reordering() {
        let mut registry = PresenceRegistry::new(Uuid::new_v4(), TIMEOUT);
        let id = Uuid::new_v4();
        for ts in [5, 3, 9, 1, 9, 7] {
            registry.update_presence(user_at(id, "Worf", PresenceStatus::Online, ts));
        }
        assert_eq!(registry.get(&id).unwrap().last_seen, 9);
    }

    #[tokio::test]
    async fn test_apply_status_creates_placeholder() {
        let mut registry = PresenceRegistry::new(Uuid::new_v4(), TIMEOUT);
        let id = Uuid::new_v4();
        registry.apply_status(id, PresenceStatus::Away, 100);

        let user = registry.get(&id).unwrap();
        assert!(user.name.starts_with("Peer-"));
        assert_eq!(user.status, PresenceStatus::Away);
    }

    #[tokio::test]
    async fn test_local_user_is_not_timed() {
        let local = Uuid::new_v4();
        let mut registry = PresenceRegistry::new(local, TIMEOUT);
        registry.update_presence(user_at(local, "Me", PresenceStatus::Online, 1));
        assert_eq!(registry.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_marks_offline() {
        let mut registry = PresenceRegistry::new(Uuid::new_v4(), TIMEOUT);
        let id = Uuid::new_v4();
        let start = Instant::now();
        registry.update_presence(user_at(id, "Crusher", PresenceStatus::Online, 1));

        let expired = registry.next_expired().await;
        assert_eq!(expired.id, id);
        assert_eq!(expired.status, PresenceStatus::Offline);
        assert!(start.elapsed() >= TIMEOUT);
        assert!(registry.online_users().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_refresh_postpones_timeout() {
        let mut registry = PresenceRegistry::new(Uuid::new_v4(), TIMEOUT);
        let id = Uuid::new_v4();
        let start = Instant::now();
        registry.update_presence(user_at(id, "Crusher", PresenceStatus::Online, 1));

        tokio::time::sleep(Duration::from_secs(30)).await;
        registry.update_presence(user_at(id, "Crusher", PresenceStatus::Online, 2));

        registry.next_expired().await;
        assert!(start.elapsed() >= Duration::from_secs(75));
    }

    #[tokio::test]
    async fn test_mark_offline_notifies_once() {
        let mut registry = PresenceRegistry::new(Uuid::new_v4(), TIMEOUT);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = registry.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let id = Uuid::new_v4();
        registry.update_presence(user_at(id, "Guinan", PresenceStatus::Online, 1));
        assert!(registry.mark_offline(&id).is_some());
        assert!(registry.mark_offline(&id).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(registry.tracked(), 0);
    }

    #[tokio::test]
    async fn test_online_users_sorted() {
        let mut registry = PresenceRegistry::new(Uuid::new_v4(), TIMEOUT);
        registry.update_presence(user_at(Uuid::new_v4(), "Worf", PresenceStatus::Online, 1));
        registry.update_presence(user_at(Uuid::new_v4(), "Data", PresenceStatus::Online, 1));
        registry.update_presence(user_at(Uuid::new_v4(), "Q", PresenceStatus::Offline, 1));

        let names: Vec<String> = registry.online_users().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["Data", "Worf"]);
        assert_eq!(registry.len(), 3);
    }
}
