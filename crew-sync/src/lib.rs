//! # crew-sync: Real-time collaboration layer for project/task entities
//!
//! Keeps a team's shared tasks and projects consistent across clients:
//! optimistic local edits, authoritative remote updates, field-level
//! conflict detection, presence and "who is editing what".
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ RelayServer  │
//! │ (per user)   │     Binary Proto    │ (dev relay)  │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ├── ConnectionManager (backoff)      ├── entity records
//!        ├── EntityStore ── conflict          └── BroadcastGroup
//!        ├── PresenceRegistry                     (fan-out)
//!        └── ActivityTracker
//! ```
//!
//! All client state is owned by one [`CollabClient`] and mutated from a
//! single task; transport callbacks only forward events into its inbox.
//!
//! ## Modules
//!
//! - [`model`]: Users, entities, conflicts and sync states
//! - [`protocol`]: Binary wire protocol (bincode-encoded WireMessage)
//! - [`events`]: Typed publish/subscribe with RAII subscriptions
//! - [`timers`]: Cancel-and-replace keyed timers
//! - [`transport`]: WebSocket and in-memory links
//! - [`connection`]: Connection lifecycle with capped exponential backoff
//! - [`presence`]: Presence registry with heartbeat expiry
//! - [`store`]: Shared entity store: optimistic writes and remote merge
//! - [`conflict`]: Field-level conflict detection and resolution
//! - [`activity`]: Ephemeral editing signals
//! - [`config`]: Client configuration
//! - [`client`]: The collaboration client tying it all together
//! - [`broadcast`]: Room-based fan-out for the relay
//! - [`server`]: WebSocket development relay

pub mod activity;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod conflict;
pub mod connection;
pub mod events;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod store;
pub mod timers;
pub mod transport;

// Re-exports for convenience
pub use activity::{ActivityTracker, ActivityUpdate};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use client::{ClientEvent, CollabClient, OfflineQueue};
pub use config::{CollabConfig, OfflinePolicy};
pub use conflict::{ResolutionStrategy, ResolveError};
pub use connection::{Backoff, ConnectionError, ConnectionManager, ConnectionState, EmitOutcome};
pub use events::{ChannelEvent, EventBus, EventKind, Subscribers, Subscription};
pub use model::{
    Conflict, Entity, EntityId, EntityKind, FieldMap, FieldValue, PendingMutation,
    PresenceStatus, ResolutionState, SyncState, Timestamp, User, UserId,
};
pub use presence::{PresenceOutcome, PresenceRegistry};
pub use protocol::{ProtocolError, WireMessage};
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use store::{EntityStore, RemoteOutcome, Resolved};
pub use timers::KeyedTimers;
pub use transport::{Connector, Link, MemoryConnector, MemoryPeer, WsConnector};
