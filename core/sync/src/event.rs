//! Remote events and observable node states.

use chrono::{DateTime, Utc};

use arborsync_common::{ConflictKind, Node, NodeChange, ObjectKey, TreePath};

/// Change reported by the remote tree.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    /// A node appeared.
    Discovered { node: Node, path: TreePath },
    /// A node's data or metadata changed.
    Modified {
        node: Node,
        change: NodeChange,
        path: TreePath,
    },
    /// A node moved to a new parent or name.
    Moved {
        node: Node,
        from: TreePath,
        to: TreePath,
    },
    /// A node was deleted.
    Deleted {
        node: Node,
        path: TreePath,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Pushing a node collided with a remote change.
    Conflict {
        node: Node,
        path: TreePath,
        conflict: ConflictKind,
    },
}

impl RemoteEvent {
    /// Node the event is about.
    pub fn node(&self) -> &Node {
        match self {
            RemoteEvent::Discovered { node, .. }
            | RemoteEvent::Modified { node, .. }
            | RemoteEvent::Moved { node, .. }
            | RemoteEvent::Deleted { node, .. }
            | RemoteEvent::Conflict { node, .. } => node,
        }
    }
}

/// Sync state of a node as seen by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Never seen.
    Unknown,
    /// Known but not linked to a local object.
    Discovered,
    /// A fetch is in flight.
    Downloading,
    /// Linked and up to date.
    Linked,
    /// Linked, with a newer remote version waiting to be fetched.
    ModifiedPendingDownload,
    /// Removed by a delete.
    Deleted,
    /// A data conflict awaits resolution by a merge.
    Conflicted,
}

/// Network reachability as reported by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Online,
    Offline,
}

/// What processing a fetched payload did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A new local object was created and linked.
    Created(ObjectKey),
    /// The linked object was replaced by the remote version.
    Replaced(ObjectKey),
    /// Pending edits were merged on top of the remote version.
    Merged(ObjectKey),
    /// Pending edits were discarded in favor of the remote version.
    FellBack(ObjectKey),
    /// The version was already merged.
    Unchanged,
    /// The parent has no local object yet.
    Deferred,
    /// The node is gone.
    Dropped,
}
