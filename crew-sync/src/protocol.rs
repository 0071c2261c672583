//! Binary wire protocol between clients and the relay.
//!
//! Every frame is a single bincode-encoded [`WireMessage`] carried in one
//! binary WebSocket message:
//! ```text
//! ┌─────────────┬──────────────────────────────┐
//! │ variant tag │ variant fields (bincode)     │
//! │ varint      │ variable                     │
//! └─────────────┴──────────────────────────────┘
//! ```
//!
//! Client → relay: `Hello`, `EntityUpdate`, `PresenceUpdate`, `ActivityUpdate`.
//! Relay → client: `Snapshot`, `EntityUpdated`, `UserJoined`, `UserLeft`,
//! `PresenceUpdate`, `ActivityUpdate`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Entity, EntityId, EntityKind, FieldMap, PresenceStatus, Timestamp, User, UserId};

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First frame on every (re)connect: join a project room.
    Hello { user: User, project_id: Uuid },

    /// Relay reply to `Hello`: current entities and peers of the room.
    Snapshot { entities: Vec<Entity>, users: Vec<User> },

    /// Outbound optimistic change.
    EntityUpdate {
        entity_id: EntityId,
        kind: EntityKind,
        changes: FieldMap,
        base_version: Timestamp,
    },

    /// Authoritative broadcast of an entity after a change.
    EntityUpdated { entity: Entity },

    UserJoined { user: User },

    UserLeft { user_id: UserId },

    PresenceUpdate {
        user_id: UserId,
        status: PresenceStatus,
        timestamp: Timestamp,
    },

    /// "X is editing Y" signal. Sent both ways.
    ActivityUpdate {
        user_id: UserId,
        entity_id: EntityId,
        active: bool,
    },
}

impl WireMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            WireMessage::Hello { .. } => "hello",
            WireMessage::Snapshot { .. } => "snapshot",
            WireMessage::EntityUpdate { .. } => "entity_update",
            WireMessage::EntityUpdated { .. } => "entity_updated",
            WireMessage::UserJoined { .. } => "user_joined",
            WireMessage::UserLeft { .. } => "user_left",
            WireMessage::PresenceUpdate { .. } => "presence_update",
            WireMessage::ActivityUpdate { .. } => "activity_update",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
