//! Download service trait definition.

use async_trait::async_trait;
use std::sync::Arc;

use arborsync_common::{Node, Result, SensitiveBytes, VersionMarker};

/// Cleartext node data together with the revision it was read at.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub cleartext: SensitiveBytes,
    pub version: VersionMarker,
}

/// Transport that retrieves and decrypts node data.
///
/// Implementations own transport concerns (encryption, caching, backoff).
/// A failed fetch is reported once; callers do not retry in a loop.
#[async_trait]
pub trait DownloadService: Send + Sync {
    /// Get the service name.
    fn name(&self) -> &str;

    /// Fetch the node's data.
    ///
    /// # Errors
    /// - Node has no data in the remote
    /// - Transport or decryption failure
    async fn fetch(&self, node: &Node) -> Result<FetchedPayload>;

    /// Fetch the node's thumbnail, if it has one.
    async fn fetch_thumbnail(&self, node: &Node) -> Result<Option<FetchedPayload>>;
}

#[async_trait]
impl<T: DownloadService + ?Sized> DownloadService for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn fetch(&self, node: &Node) -> Result<FetchedPayload> {
        (**self).fetch(node).await
    }

    async fn fetch_thumbnail(&self, node: &Node) -> Result<Option<FetchedPayload>> {
        (**self).fetch_thumbnail(node).await
    }
}
