//! Client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::connection::Backoff;

/// What the client does with entity updates made while disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OfflinePolicy {
    /// Queue outbound entity updates and flush them on reconnect.
    #[default]
    QueueAndFlush,
    /// Drop them; the optimistic local copy stays pending.
    Drop,
}

/// Collaboration client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollabConfig {
    /// Relay WebSocket URL
    pub server_url: String,
    /// Project room to join
    pub project_id: Uuid,
    /// Reconnection policy
    pub reconnect: Backoff,
    /// How often the local user re-announces presence
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is marked offline
    pub presence_timeout: Duration,
    /// Inactivity after which an editing signal expires
    pub activity_timeout: Duration,
    /// Channel events buffered between the connection and the client loop
    pub inbox_capacity: usize,
    pub offline_policy: OfflinePolicy,
    /// Maximum queued entity updates while offline
    pub offline_queue_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            project_id: Uuid::nil(),
            reconnect: Backoff::default(),
            heartbeat_interval: Duration::from_secs(15),
            presence_timeout: Duration::from_secs(45),
            activity_timeout: Duration::from_secs(10),
            inbox_capacity: 1024,
            offline_policy: OfflinePolicy::default(),
            offline_queue_capacity: 10_000,
        }
    }
}

impl CollabConfig {
    /// Default configuration for one project on one relay.
    pub fn for_project(server_url: impl Into<String>, project_id: Uuid) -> Self {
        Self {
            server_url: server_url.into(),
            project_id,
            ..Self::default()
        }
    }
}
