//! Remote tree node metadata.
//!
//! A node describes where an entry lives in the remote tree and who may read
//! it. The node's data (the serialized local object) is fetched separately
//! through the download service.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{NodeId, UserId, VersionMarker};

/// Permission granted to a user on a shared node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    Read,
    Write,
}

/// Per-user permissions on a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareList {
    entries: BTreeMap<UserId, BTreeSet<Permission>>,
}

impl ShareList {
    /// Create an empty share list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a permission to a user.
    pub fn grant(&mut self, user: UserId, permission: Permission) {
        self.entries.entry(user).or_default().insert(permission);
    }

    /// Remove every permission for a user. Returns whether the user was present.
    pub fn revoke(&mut self, user: &UserId) -> bool {
        self.entries.remove(user).is_some()
    }

    /// Check whether a user holds a permission.
    pub fn has(&self, user: &UserId, permission: Permission) -> bool {
        self.entries
            .get(user)
            .is_some_and(|perms| perms.contains(&permission))
    }

    /// Users present in the list.
    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.entries.keys()
    }

    /// Number of users in the list.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Remote tree entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier.
    pub id: NodeId,
    /// Local user whose tree this node belongs to.
    pub owner: UserId,
    /// Parent node. `None` only for a user's root.
    pub parent: Option<NodeId>,
    /// Cleartext node name.
    pub name: String,
    /// Remote revision of the node's data. `None` until first uploaded.
    pub version: Option<VersionMarker>,
    /// Sharing permissions.
    pub share_list: ShareList,
}

impl Node {
    /// Create a root node for a user.
    pub fn root(id: NodeId, owner: UserId) -> Self {
        Self {
            id,
            owner,
            parent: None,
            name: "home".to_string(),
            version: None,
            share_list: ShareList::new(),
        }
    }

    /// Create a child node.
    pub fn child(
        id: NodeId,
        owner: UserId,
        parent: NodeId,
        name: impl Into<String>,
        version: Option<VersionMarker>,
    ) -> Self {
        Self {
            id,
            owner,
            parent: Some(parent),
            name: name.into(),
            version,
            share_list: ShareList::new(),
        }
    }

    /// Check if this is a user's root.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// What changed about a modified node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeChange {
    /// The node's data (payload) changed.
    Data,
    /// Only tree metadata changed (permissions, name).
    Metadata,
}

/// Kind of conflict reported while pushing a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Two creations collided on the same tree slot.
    Path,
    /// The node's data was edited concurrently.
    Data,
}
