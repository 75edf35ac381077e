//! Conflict resolution policies.

use serde::{Deserialize, Serialize};

use arborsync_common::{ConflictKind, ObjectKind};

/// How a data conflict on one object kind is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Drop the pending upload and keep the local object as is.
    SkipUpload,
    /// Re-fetch the remote version and merge pending edits into it.
    MergeRefetch,
    /// Discard local changes and accept the remote version.
    Overwrite,
}

/// Policy per object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPolicies {
    pub container: ConflictPolicy,
    pub item: ConflictPolicy,
    pub attachment: ConflictPolicy,
}

impl ConflictPolicies {
    /// Policy for a kind.
    pub fn for_kind(&self, kind: ObjectKind) -> ConflictPolicy {
        match kind {
            ObjectKind::Container => self.container,
            ObjectKind::Item => self.item,
            ObjectKind::Attachment => self.attachment,
        }
    }

    /// Replace the policy of a kind.
    pub fn with(mut self, kind: ObjectKind, policy: ConflictPolicy) -> Self {
        match kind {
            ObjectKind::Container => self.container = policy,
            ObjectKind::Item => self.item = policy,
            ObjectKind::Attachment => self.attachment = policy,
        }
        self
    }
}

impl Default for ConflictPolicies {
    fn default() -> Self {
        Self {
            container: ConflictPolicy::SkipUpload,
            item: ConflictPolicy::MergeRefetch,
            attachment: ConflictPolicy::Overwrite,
        }
    }
}

/// What the controller does in response to a conflict report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Nothing to do locally.
    Ignore,
    /// Clear pending uploads; leave the object alone.
    SkipUpload,
    /// Mark the node for download and fetch it.
    Refetch {
        /// Drop pending edits instead of merging them.
        discard_local: bool,
    },
}

/// Conflict resolver.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policies: ConflictPolicies,
}

impl ConflictResolver {
    /// Create a resolver with the given policy table.
    pub fn new(policies: ConflictPolicies) -> Self {
        Self { policies }
    }

    /// Decide how to handle a conflict on a node of the given kind.
    ///
    /// Path conflicts are left to the upload pipeline, which retries under a
    /// fresh name. Root nodes (`kind == None`) carry no data.
    pub fn resolve(&self, conflict: ConflictKind, kind: Option<ObjectKind>) -> ConflictAction {
        let (ConflictKind::Data, Some(kind)) = (conflict, kind) else {
            return ConflictAction::Ignore;
        };

        match self.policies.for_kind(kind) {
            ConflictPolicy::SkipUpload => ConflictAction::SkipUpload,
            ConflictPolicy::MergeRefetch => ConflictAction::Refetch {
                discard_local: false,
            },
            ConflictPolicy::Overwrite => ConflictAction::Refetch {
                discard_local: true,
            },
        }
    }

    /// Get the policy table.
    pub fn policies(&self) -> &ConflictPolicies {
        &self.policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matrix() {
        let resolver = ConflictResolver::default();

        assert_eq!(
            resolver.resolve(ConflictKind::Data, Some(ObjectKind::Container)),
            ConflictAction::SkipUpload
        );
        assert_eq!(
            resolver.resolve(ConflictKind::Data, Some(ObjectKind::Item)),
            ConflictAction::Refetch {
                discard_local: false
            }
        );
        assert_eq!(
            resolver.resolve(ConflictKind::Data, Some(ObjectKind::Attachment)),
            ConflictAction::Refetch {
                discard_local: true
            }
        );
    }

    #[test]
    fn test_path_conflicts_ignored() {
        let resolver = ConflictResolver::default();
        for kind in ObjectKind::all() {
            assert_eq!(
                resolver.resolve(ConflictKind::Path, Some(kind)),
                ConflictAction::Ignore
            );
        }
        assert_eq!(
            resolver.resolve(ConflictKind::Data, None),
            ConflictAction::Ignore
        );
    }

    #[test]
    fn test_policy_override() {
        let policies =
            ConflictPolicies::default().with(ObjectKind::Container, ConflictPolicy::MergeRefetch);
        let resolver = ConflictResolver::new(policies);

        assert_eq!(
            resolver.resolve(ConflictKind::Data, Some(ObjectKind::Container)),
            ConflictAction::Refetch {
                discard_local: false
            }
        );
    }
}
