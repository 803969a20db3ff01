use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod entities;

pub use entities::{Actor, ActorKind, Affiliation, Evidence, Role, Source};

/// Attribute name → value mapping of a local record.
pub type Attributes = BTreeMap<String, Value>;

/// Relation name → linked local record ids.
pub type Links = BTreeMap<String, BTreeSet<RecordId>>;

/// Primary key of a record in the local store.
pub type RecordId = i64;

/// The fixed set of entity kinds known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Actor,
    Role,
    Affiliation,
    Source,
    Evidence,
    Category,
    Channel,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Actor,
        EntityKind::Role,
        EntityKind::Affiliation,
        EntityKind::Source,
        EntityKind::Evidence,
        EntityKind::Category,
        EntityKind::Channel,
    ];

    /// Stable lowercase name used in the store and in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Actor => "actor",
            EntityKind::Role => "role",
            EntityKind::Affiliation => "affiliation",
            EntityKind::Source => "source",
            EntityKind::Evidence => "evidence",
            EntityKind::Category => "category",
            EntityKind::Channel => "channel",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Vocabulary kinds (categories, channels) are keyed by label and never
    /// have a table of their own.
    pub fn is_tabled(&self) -> bool {
        !matches!(self, EntityKind::Category | EntityKind::Channel)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier issued by the remote table service. Numeric identifiers are kept
/// in their decimal string form so they compare equal across transports.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Reads an identifier from a JSON scalar. Blank strings are rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
            }
            Value::Number(number) => Some(Self(number.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// JSON form sent back to the remote: numbers stay numbers.
    pub fn to_value(&self) -> Value {
        self.0
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(self.0.clone()))
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Completion state of a local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// All mapped attributes have been written from the remote row.
    Complete,
    /// Created lazily from a reference; waiting for its own row.
    Placeholder,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Complete => "complete",
            SyncState::Placeholder => "placeholder",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "complete" => Some(SyncState::Complete),
            "placeholder" => Some(SyncState::Placeholder),
            _ => None,
        }
    }
}

/// A local entity as persisted by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub kind: EntityKind,
    /// `None` marks a local-origin record that import never touches.
    pub external_id: Option<ExternalId>,
    pub sync_uuid: Uuid,
    pub attributes: Attributes,
    pub state: SyncState,
    /// Set when the record changed locally after its last export.
    pub dirty: bool,
    pub synced_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).filter(|value| !value.is_null())
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.attribute(name).and_then(Value::as_str)
    }

    pub fn is_placeholder(&self) -> bool {
        self.state == SyncState::Placeholder
    }
}

/// Attribute values for a record that does not exist yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub kind: EntityKind,
    pub external_id: Option<ExternalId>,
    pub attributes: Attributes,
    pub state: SyncState,
}

impl NewRecord {
    pub fn new(kind: EntityKind, external_id: Option<ExternalId>, attributes: Attributes) -> Self {
        Self {
            kind,
            external_id,
            attributes,
            state: SyncState::Complete,
        }
    }

    /// Minimal record standing in for a referenced row that was not seen yet.
    pub fn placeholder(kind: EntityKind, external_id: ExternalId) -> Self {
        Self {
            kind,
            external_id: Some(external_id),
            attributes: Attributes::new(),
            state: SyncState::Placeholder,
        }
    }
}
