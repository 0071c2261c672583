//! Shared data model: users, entities, pending mutations and conflicts.
//!
//! Every type here crosses the wire inside a [`WireMessage`](crate::protocol::WireMessage),
//! so all of them are serde-serializable and bincode-friendly (no
//! self-describing formats are assumed).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub type UserId = Uuid;
pub type EntityId = Uuid;
pub type ConflictId = Uuid;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Ordered field set of an entity (`name → value`).
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}

// ───────────────────────────────────────────────────────────────────
// Field values
// ───────────────────────────────────────────────────────────────────

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Int(n)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Float(n)
    }
}

/// Build a [`FieldMap`] from `(name, value)` pairs.
///
/// ```
/// use crew_sync::model::{fields, FieldValue};
/// let f = fields([("title", "Fix warp core"), ("status", "todo")]);
/// assert_eq!(f["title"], FieldValue::from("Fix warp core"));
/// ```
pub fn fields<K, V, I>(pairs: I) -> FieldMap
where
    K: Into<String>,
    V: Into<FieldValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

// ───────────────────────────────────────────────────────────────────
// Users & presence
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
}

/// A collaborator and their last-known presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub status: PresenceStatus,
    /// Timestamp of the presence announcement this record came from.
    pub last_seen: Timestamp,
    /// Entity the user is currently focused on, if any.
    pub current_focus: Option<EntityId>,
}

impl User {
    /// A new online user seen now.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit id (for testing and for known accounts).
    pub fn with_id(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: PresenceStatus::Online,
            last_seen: now_millis(),
            current_focus: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }
}

// ───────────────────────────────────────────────────────────────────
// Entities
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntityKind {
    #[default]
    Task,
    Project,
}

/// A shared mutable record (task or project).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub fields: FieldMap,
    /// Version stamp; never decreases in a local cache.
    pub last_modified: Timestamp,
    pub modified_by: UserId,
}

impl Entity {
    /// An empty entity at version zero.
    pub fn new(id: EntityId, kind: EntityKind, modified_by: UserId) -> Self {
        Self {
            id,
            kind,
            fields: FieldMap::new(),
            last_modified: 0,
            modified_by,
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Builder-style version setter.
    pub fn at_version(mut self, last_modified: Timestamp) -> Self {
        self.last_modified = last_modified;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Overlay `changes` onto the field set.
    pub fn apply_changes(&mut self, changes: &FieldMap) {
        for (name, value) in changes {
            self.fields.insert(name.clone(), value.clone());
        }
    }
}

/// An optimistic local change not yet acknowledged by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub entity_id: EntityId,
    pub changes: FieldMap,
    /// `last_modified` of the known-good copy the change was made against.
    pub base_version: Timestamp,
    pub local_timestamp: Timestamp,
}

// ───────────────────────────────────────────────────────────────────
// Conflicts
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionState {
    Pending,
    ResolvedLocal,
    ResolvedRemote,
    ResolvedMerged,
}

/// Divergence between a pending local mutation and a remote update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub entity_id: EntityId,
    pub local_changes: FieldMap,
    /// Fields the remote changed relative to the local known-good copy.
    pub remote_changes: FieldMap,
    pub detected_at: Timestamp,
    pub resolution_state: ResolutionState,
    /// Base version of the superseded pending mutation.
    pub base_version: Timestamp,
    /// Latest remote copy seen for the entity while the conflict is open.
    pub remote_entity: Entity,
}

impl Conflict {
    pub fn is_open(&self) -> bool {
        self.resolution_state == ResolutionState::Pending
    }
}

/// Client-local synchronisation state of one entity.
///
/// `Clean → Pending → {Merged | Conflicted} → Clean`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Clean,
    Pending,
    /// A remote update was merged underneath a still-pending mutation.
    Merged,
    Conflicted,
}
