//! Persisted table of remote tree nodes.
//!
//! Holds every discovered node together with its sync bookkeeping: the
//! needs-download flag, the version last merged locally and conflict state.
//! The table survives restarts so the sweep can resume after a crash.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use tokio::fs;

use arborsync_common::{Error, Node, NodeId, Result, TreePath, UserId, VersionMarker};

/// Deleted node ids remembered for state queries, oldest dropped first.
const MAX_TOMBSTONES: usize = 1024;

/// A node plus its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Remote metadata as last reported.
    pub node: Node,
    /// Depth below the owner's root. Always parent depth + 1.
    pub depth: usize,
    /// A remote version has not yet been fetched and merged.
    pub needs_download: bool,
    /// Version whose data was last merged into the linked object.
    pub merged_version: Option<VersionMarker>,
    /// A data conflict was reported and has not been resolved by a merge.
    pub conflicted: bool,
    /// Node metadata (share list) changed locally and awaits upload.
    pub metadata_upload_pending: bool,
}

impl NodeRecord {
    fn new(node: Node, depth: usize) -> Self {
        Self {
            node,
            depth,
            needs_download: false,
            merged_version: None,
            conflicted: false,
            metadata_upload_pending: false,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.node.id
    }
}

/// Node table indexed by id, parent and owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeTree {
    records: HashMap<NodeId, NodeRecord>,
    roots: BTreeMap<UserId, NodeId>,
    tombstones: VecDeque<NodeId>,
    #[serde(skip)]
    children: HashMap<NodeId, BTreeSet<NodeId>>,
}

impl NodeTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node or update its metadata.
    ///
    /// Sync bookkeeping of an existing record is preserved. A changed parent
    /// moves the node together with its subtree.
    ///
    /// # Errors
    /// - Parent is not in the tree
    /// - Node would become its own ancestor
    pub fn upsert(&mut self, node: Node) -> Result<&mut NodeRecord> {
        let depth = match &node.parent {
            None => 0,
            Some(parent) => {
                let parent_record = self.records.get(parent).ok_or_else(|| {
                    Error::NotFound(format!("Parent {} of node {} is unknown", parent, node.id))
                })?;
                if parent == &node.id || self.is_ancestor(&node.id, parent) {
                    return Err(Error::InvalidInput(format!(
                        "Node {} cannot be moved under its own subtree",
                        node.id
                    )));
                }
                parent_record.depth + 1
            }
        };

        let id = node.id.clone();
        self.tombstones.retain(|t| t != &id);
        if node.parent.is_none() {
            self.roots.insert(node.owner.clone(), id.clone());
        }

        let previous_parent = self.records.get(&id).map(|r| r.node.parent.clone());
        match previous_parent {
            Some(previous_parent) => {
                if previous_parent != node.parent {
                    if let Some(old) = &previous_parent {
                        if let Some(siblings) = self.children.get_mut(old) {
                            siblings.remove(&id);
                        }
                    }
                    if let Some(new) = &node.parent {
                        self.children.entry(new.clone()).or_default().insert(id.clone());
                    }
                }
                if let Some(record) = self.records.get_mut(&id) {
                    record.node = node;
                }
                self.set_depth(&id, depth);
            }
            None => {
                if let Some(parent) = &node.parent {
                    self.children.entry(parent.clone()).or_default().insert(id.clone());
                }
                self.records.insert(id.clone(), NodeRecord::new(node, depth));
            }
        }

        self.records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Node {} vanished during upsert", id)))
    }

    fn set_depth(&mut self, id: &NodeId, depth: usize) {
        let mut stack = vec![(id.clone(), depth)];
        while let Some((current, depth)) = stack.pop() {
            if let Some(record) = self.records.get_mut(&current) {
                record.depth = depth;
            }
            for child in self.children.get(&current).into_iter().flatten() {
                stack.push((child.clone(), depth + 1));
            }
        }
    }

    fn is_ancestor(&self, ancestor: &NodeId, of: &NodeId) -> bool {
        let mut current = self.records.get(of).and_then(|r| r.node.parent.clone());
        while let Some(id) = current {
            if &id == ancestor {
                return true;
            }
            current = self.records.get(&id).and_then(|r| r.node.parent.clone());
        }
        false
    }

    /// Get a node record.
    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.records.get(id)
    }

    /// Get a mutable node record.
    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut NodeRecord> {
        self.records.get_mut(id)
    }

    /// Direct children of a node.
    pub fn children(&self, id: &NodeId) -> Vec<NodeId> {
        self.children
            .get(id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Find a direct child by name.
    pub fn find_child(&self, parent: &NodeId, name: &str) -> Option<&NodeRecord> {
        self.children
            .get(parent)?
            .iter()
            .filter_map(|id| self.records.get(id))
            .find(|record| record.node.name == name)
    }

    /// Root node of a user's tree.
    pub fn root(&self, user: &UserId) -> Option<&NodeId> {
        self.roots.get(user)
    }

    /// Users with a known root.
    pub fn users(&self) -> Vec<UserId> {
        self.roots.keys().cloned().collect()
    }

    /// Path of a node relative to its owner's root.
    pub fn path_of(&self, id: &NodeId) -> Option<TreePath> {
        let mut names = Vec::new();
        let mut current = self.records.get(id)?;
        while let Some(parent) = &current.node.parent {
            names.push(current.node.name.clone());
            current = self.records.get(parent)?;
        }
        names.reverse();
        TreePath::from_components(names).ok()
    }

    /// Set the needs-download flag. Returns whether the node exists.
    pub fn mark_needs_download(&mut self, id: &NodeId) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.needs_download = true;
                true
            }
            None => false,
        }
    }

    /// Record that `version` was fetched and merged.
    ///
    /// The node adopts `version` as its current marker, and the
    /// needs-download and conflict flags are cleared. Callers must have
    /// checked that the marker did not move since the fetch was issued.
    /// Returns whether the node exists.
    pub fn mark_merged(&mut self, id: &NodeId, version: &VersionMarker) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.node.version = Some(version.clone());
                record.merged_version = Some(version.clone());
                record.needs_download = false;
                record.conflicted = false;
                true
            }
            None => false,
        }
    }

    /// A node and everything below it, parent-before-child, without
    /// modifying the tree.
    pub fn subtree(&self, id: &NodeId) -> Vec<&NodeRecord> {
        let mut found = Vec::new();
        let mut queue = VecDeque::from([id.clone()]);
        while let Some(current) = queue.pop_front() {
            if let Some(record) = self.records.get(&current) {
                found.push(record);
                queue.extend(self.children(&current));
            }
        }
        found
    }

    /// Remove a node and everything below it, leaving tombstones.
    ///
    /// Records are returned parent-before-child.
    pub fn remove_subtree(&mut self, id: &NodeId) -> Vec<NodeRecord> {
        let mut removed = Vec::new();
        if let Some(parent) = self.records.get(id).and_then(|r| r.node.parent.clone()) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(id);
            }
        }

        let mut queue = VecDeque::from([id.clone()]);
        while let Some(current) = queue.pop_front() {
            if let Some(children) = self.children.remove(&current) {
                queue.extend(children);
            }
            if let Some(record) = self.records.remove(&current) {
                if record.node.parent.is_none() {
                    self.roots.remove(&record.node.owner);
                }
                self.tombstone(current);
                removed.push(record);
            }
        }
        removed
    }

    fn tombstone(&mut self, id: NodeId) {
        self.tombstones.retain(|t| t != &id);
        self.tombstones.push_back(id);
        while self.tombstones.len() > MAX_TOMBSTONES {
            self.tombstones.pop_front();
        }
    }

    /// Whether a node was removed by a delete.
    pub fn is_tombstoned(&self, id: &NodeId) -> bool {
        self.tombstones.contains(id)
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the tree has no live nodes.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every live record.
    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.values()
    }

    fn rebuild_children(&mut self) {
        self.children.clear();
        for record in self.records.values() {
            if let Some(parent) = &record.node.parent {
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .insert(record.node.id.clone());
            }
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut tree: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        tree.rebuild_children();
        Ok(tree)
    }

    /// Write the table to a file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, self.to_json()?).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Load the table from a file. A missing file yields an empty tree.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        match fs::read_to_string(path.as_ref()).await {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn user() -> UserId {
        UserId::new("alice").unwrap()
    }

    fn child(node: &str, parent: &str, version: &str) -> Node {
        Node::child(id(node), user(), id(parent), node, Some(VersionMarker::new(version)))
    }

    fn sample_tree() -> NodeTree {
        let mut tree = NodeTree::new();
        tree.upsert(Node::root(id("home"), user())).unwrap();
        tree.upsert(child("list", "home", "v1")).unwrap();
        tree.upsert(child("task", "list", "v1")).unwrap();
        tree.upsert(child("img", "task", "v1")).unwrap();
        tree
    }

    #[test]
    fn test_depth_follows_parent() {
        let tree = sample_tree();
        assert_eq!(tree.get(&id("home")).unwrap().depth, 0);
        assert_eq!(tree.get(&id("list")).unwrap().depth, 1);
        assert_eq!(tree.get(&id("task")).unwrap().depth, 2);
        assert_eq!(tree.get(&id("img")).unwrap().depth, 3);
        assert_eq!(tree.root(&user()), Some(&id("home")));
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let mut tree = NodeTree::new();
        assert!(matches!(
            tree.upsert(child("task", "missing", "v1")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_upsert_preserves_bookkeeping() {
        let mut tree = sample_tree();
        tree.mark_needs_download(&id("task"));
        tree.upsert(child("task", "list", "v2")).unwrap();

        let record = tree.get(&id("task")).unwrap();
        assert!(record.needs_download);
        assert_eq!(record.node.version, Some(VersionMarker::new("v2")));
    }

    #[test]
    fn test_mark_merged_adopts_fetched_version() {
        let mut tree = sample_tree();
        tree.mark_needs_download(&id("task"));
        tree.get_mut(&id("task")).unwrap().conflicted = true;

        assert!(tree.mark_merged(&id("task"), &VersionMarker::new("v3")));
        let record = tree.get(&id("task")).unwrap();
        assert!(!record.needs_download);
        assert!(!record.conflicted);
        assert_eq!(record.node.version, Some(VersionMarker::new("v3")));
        assert_eq!(record.merged_version, Some(VersionMarker::new("v3")));

        assert!(!tree.mark_merged(&id("missing"), &VersionMarker::new("v1")));
    }

    #[test]
    fn test_subtree_is_read_only() {
        let tree = sample_tree();
        let ids: Vec<_> = tree.subtree(&id("list")).iter().map(|r| r.id().clone()).collect();
        assert_eq!(ids, vec![id("list"), id("task"), id("img")]);
        assert_eq!(tree.len(), 4);
        assert!(!tree.is_tombstoned(&id("list")));
    }

    #[test]
    fn test_move_recomputes_subtree_depth() {
        let mut tree = sample_tree();
        tree.upsert(child("other", "home", "v1")).unwrap();
        tree.upsert(child("deep", "other", "v1")).unwrap();

        // Move the list under another container.
        tree.upsert(child("list", "deep", "v1")).unwrap();

        assert_eq!(tree.get(&id("list")).unwrap().depth, 3);
        assert_eq!(tree.get(&id("img")).unwrap().depth, 5);
        assert!(tree.children(&id("home")).iter().all(|c| c != &id("list")));
        assert_eq!(
            tree.path_of(&id("task")).unwrap().to_string_path(),
            "/other/deep/list/task"
        );
    }

    #[test]
    fn test_move_into_own_subtree_rejected() {
        let mut tree = sample_tree();
        assert!(tree.upsert(child("list", "task", "v1")).is_err());
    }

    #[test]
    fn test_remove_subtree_leaves_tombstones() {
        let mut tree = sample_tree();
        let removed = tree.remove_subtree(&id("list"));

        let removed_ids: Vec<_> = removed.iter().map(|r| r.id().clone()).collect();
        assert_eq!(removed_ids, vec![id("list"), id("task"), id("img")]);
        assert!(tree.is_tombstoned(&id("task")));
        assert!(tree.children(&id("home")).is_empty());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_tombstones_are_bounded_and_cleared_on_return() {
        let mut tree = NodeTree::new();
        tree.upsert(Node::root(id("home"), user())).unwrap();
        for i in 0..MAX_TOMBSTONES + 10 {
            let name = format!("n{}", i);
            tree.upsert(child(&name, "home", "v1")).unwrap();
            tree.remove_subtree(&id(&name));
        }
        assert!(!tree.is_tombstoned(&id("n0")));
        assert!(tree.is_tombstoned(&id(&format!("n{}", MAX_TOMBSTONES + 9))));

        let last = format!("n{}", MAX_TOMBSTONES + 9);
        tree.upsert(child(&last, "home", "v2")).unwrap();
        assert!(!tree.is_tombstoned(&id(&last)));
    }

    #[test]
    fn test_find_child_by_name() {
        let tree = sample_tree();
        assert_eq!(tree.find_child(&id("task"), "img").unwrap().id(), &id("img"));
        assert!(tree.find_child(&id("task"), "thumb").is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nodes.json");

        let mut tree = sample_tree();
        tree.mark_needs_download(&id("task"));
        tree.save(&path).await.unwrap();

        let restored = NodeTree::load(&path).await.unwrap();
        assert_eq!(restored.len(), 4);
        assert!(restored.get(&id("task")).unwrap().needs_download);
        assert_eq!(restored.children(&id("list")), vec![id("task")]);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let tree = NodeTree::load(temp.path().join("absent.json")).await.unwrap();
        assert!(tree.is_empty());
    }
}
