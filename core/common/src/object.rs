//! Local domain objects.
//!
//! Every node that is materialized locally maps to exactly one object of a
//! fixed kind. The kind follows from the node's depth in the tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::LocalId;

/// Kind of local object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Top-level grouping (depth 1).
    Container,
    /// Entry inside a container (depth 2).
    Item,
    /// Binary payload attached to an item (depth 3 and below).
    Attachment,
}

impl ObjectKind {
    /// Classify a node by its depth below the user's root.
    pub fn from_depth(depth: usize) -> Option<Self> {
        match depth {
            0 => None,
            1 => Some(ObjectKind::Container),
            2 => Some(ObjectKind::Item),
            _ => Some(ObjectKind::Attachment),
        }
    }

    /// Stable lowercase name, used for storage layout and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Container => "container",
            ObjectKind::Item => "item",
            ObjectKind::Attachment => "attachment",
        }
    }

    /// All kinds, in tree order.
    pub fn all() -> [ObjectKind; 3] {
        [ObjectKind::Container, ObjectKind::Item, ObjectKind::Attachment]
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage key of a local object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub id: LocalId,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, id: LocalId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Container payload. Carries a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerData {
    pub name: String,
}

/// Item priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Item payload. Fields are merged independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemData {
    pub title: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl ItemData {
    /// Create an item with default fields.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            details: None,
            completed: false,
            priority: Priority::Normal,
            created_at: Utc::now(),
        }
    }
}

/// Attachment payload. Opaque bytes, never merged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentData {
    pub bytes: Vec<u8>,
}

impl fmt::Debug for AttachmentData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentData({} bytes)", self.bytes.len())
    }
}

/// Kind-specific payload of a local object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Payload {
    Container(ContainerData),
    Item(ItemData),
    Attachment(AttachmentData),
}

impl Payload {
    /// Kind implied by this payload.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Payload::Container(_) => ObjectKind::Container,
            Payload::Item(_) => ObjectKind::Item,
            Payload::Attachment(_) => ObjectKind::Attachment,
        }
    }
}

/// A domain object persisted in the storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObject {
    /// Unique local id.
    pub id: LocalId,
    /// Local id of the owning aggregate (container for items, item for attachments).
    pub parent: Option<LocalId>,
    /// Kind-specific payload.
    pub payload: Payload,
}

impl LocalObject {
    /// Create an object with a fresh local id.
    pub fn new(parent: Option<LocalId>, payload: Payload) -> Self {
        Self {
            id: LocalId::generate(),
            parent,
            payload,
        }
    }

    /// Kind of this object.
    pub fn kind(&self) -> ObjectKind {
        self.payload.kind()
    }

    /// Storage key of this object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind(), self.id.clone())
    }
}
