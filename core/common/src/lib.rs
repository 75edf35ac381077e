//! Common utilities and types shared across ArborSync modules.
//!
//! This module provides foundational types that are used throughout the codebase:
//! identifiers, tree paths, remote node metadata and the local object model.

pub mod error;
pub mod node;
pub mod object;
pub mod types;

pub use error::{Error, Result};
pub use node::{ConflictKind, Node, NodeChange, Permission, ShareList};
pub use object::{
    AttachmentData, ContainerData, ItemData, LocalObject, ObjectKey, ObjectKind, Payload,
    Priority,
};
pub use types::{LocalId, NodeId, SensitiveBytes, TreePath, UserId, VersionMarker};
