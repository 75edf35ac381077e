//! Collaborator contracts consumed by the ArborSync reconciliation engine.
//!
//! This module provides the trait-based interfaces for the local object store
//! and for the remote download transport, along with reference implementations:
//!
//! - `MemoryBackend` / `FileBackend`: storage backends with single-writer commits
//! - `MemoryRemote`: in-memory payload source for tests and embedders
//! - `RetryingDownloader`: backoff wrapper for any download service

pub mod backend;
pub mod download;
pub mod file;
pub mod memory;
pub mod remote;
pub mod retry;

pub use backend::{StorageBackend, StorageChange, StorageEvent, WriteBatch};
pub use download::{DownloadService, FetchedPayload};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use remote::MemoryRemote;
pub use retry::{Backoff, RetryingDownloader};
