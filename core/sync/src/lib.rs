//! ArborSync reconciliation engine
//!
//! This module keeps a local object store in step with a remote tree:
//! - Node table with needs-download flags that survives restarts
//! - Link registry between remote nodes and local objects
//! - Download scheduling with per-node coalescing and dependency ordering
//! - Decoding and field-level merging of fetched payloads with pending edits
//! - Per-kind conflict policies and remote delete handling
//! - Sweeps on startup, reconnect and on a timer

pub mod changeset;
pub mod config;
pub mod controller;
pub mod event;
pub mod link;
pub mod local;
pub mod merge;
pub mod policy;
pub mod scheduler;
pub mod sweep;
pub mod tree;

// Re-export main types
pub use changeset::{Changeset, ChangesetLog, FieldEdit};
pub use config::{DeletePolicy, ReconcilerConfig, SweepMode};
pub use controller::Reconciler;
pub use event::{FetchOutcome, NodeState, Reachability, RemoteEvent};
pub use link::{Link, LinkRegistry};
pub use local::ATTACHMENT_NODE_NAME;
pub use merge::{MergeKind, MergeOutcome, ObjectDraft};
pub use policy::{ConflictAction, ConflictPolicies, ConflictPolicy, ConflictResolver};
pub use scheduler::{DownloadScheduler, FetchCompletion, FetchTicket};
pub use sweep::{SweepReason, SweepReport, SweepScanner, SweepTrigger};
pub use tree::{NodeRecord, NodeTree};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = ReconcilerConfig::default();
        let _resolver = ConflictResolver::default();
        let _tree = NodeTree::new();
        let _links = LinkRegistry::new();
        let _log = ChangesetLog::in_memory();
    }
}
