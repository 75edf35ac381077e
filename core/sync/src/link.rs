//! Bidirectional map between remote nodes and local objects.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::fs;
use tracing::debug;

use arborsync_common::{Error, LocalId, NodeId, ObjectKey, ObjectKind, Result};

/// One node-to-object association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub node_id: NodeId,
    pub key: ObjectKey,
}

#[derive(Debug, Default)]
struct LinkTables {
    by_node: HashMap<NodeId, ObjectKey>,
    by_object: HashMap<ObjectKey, NodeId>,
}

/// Link registry.
///
/// Both directions live under one lock, so a node is linked to at most one
/// object and an object to at most one node at every instant.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    tables: RwLock<LinkTables>,
}

impl LinkRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, LinkTables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LinkTables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Associate a node with a local object.
    ///
    /// # Errors
    /// - `AlreadyLinked` if either the node or the object has a link
    pub fn link(&self, node_id: &NodeId, kind: ObjectKind, local_id: &LocalId) -> Result<()> {
        let key = ObjectKey::new(kind, local_id.clone());
        let mut tables = self.write();

        if let Some(existing) = tables.by_node.get(node_id) {
            return Err(Error::AlreadyLinked(format!(
                "Node {} is linked to {}",
                node_id, existing
            )));
        }
        if let Some(existing) = tables.by_object.get(&key) {
            return Err(Error::AlreadyLinked(format!(
                "Object {} is linked to node {}",
                key, existing
            )));
        }

        tables.by_node.insert(node_id.clone(), key.clone());
        tables.by_object.insert(key.clone(), node_id.clone());
        debug!(node_id = %node_id, object = %key, "Linked node");
        Ok(())
    }

    /// Object linked to a node.
    pub fn lookup(&self, node_id: &NodeId) -> Option<ObjectKey> {
        self.read().by_node.get(node_id).cloned()
    }

    /// Node linked to an object.
    pub fn lookup_node(&self, key: &ObjectKey) -> Option<NodeId> {
        self.read().by_object.get(key).cloned()
    }

    /// Check whether a node is linked.
    pub fn is_linked(&self, node_id: &NodeId) -> bool {
        self.read().by_node.contains_key(node_id)
    }

    /// Remove the link of a node. Returns the object it pointed at.
    pub fn unlink_node(&self, node_id: &NodeId) -> Option<ObjectKey> {
        let mut tables = self.write();
        let key = tables.by_node.remove(node_id)?;
        tables.by_object.remove(&key);
        debug!(node_id = %node_id, object = %key, "Unlinked node");
        Some(key)
    }

    /// Remove the link of an object. Returns the node it pointed at.
    pub fn unlink_object(&self, key: &ObjectKey) -> Option<NodeId> {
        let mut tables = self.write();
        let node_id = tables.by_object.remove(key)?;
        tables.by_node.remove(&node_id);
        Some(node_id)
    }

    /// Number of links.
    pub fn len(&self) -> usize {
        self.read().by_node.len()
    }

    /// Check if there are no links.
    pub fn is_empty(&self) -> bool {
        self.read().by_node.is_empty()
    }

    /// Snapshot of every link, ordered by node id.
    pub fn snapshot(&self) -> Vec<Link> {
        let mut links: Vec<Link> = self
            .read()
            .by_node
            .iter()
            .map(|(node_id, key)| Link {
                node_id: node_id.clone(),
                key: key.clone(),
            })
            .collect();
        links.sort_by(|a, b| a.node_id.as_str().cmp(b.node_id.as_str()));
        links
    }

    /// Rebuild a registry from a snapshot.
    ///
    /// # Errors
    /// - `AlreadyLinked` if the snapshot links either side twice
    pub fn from_links(links: Vec<Link>) -> Result<Self> {
        let registry = Self::new();
        for link in links {
            registry.link(&link.node_id, link.key.kind, &link.key.id)?;
        }
        Ok(registry)
    }

    /// Write the registry to a file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Load a registry from a file. A missing file yields an empty registry.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        match fs::read_to_string(path.as_ref()).await {
            Ok(json) => Self::from_links(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
