//! In-memory remote for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use arborsync_common::{Error, Node, NodeId, Result, SensitiveBytes, VersionMarker};

use crate::download::{DownloadService, FetchedPayload};

#[derive(Debug, Clone)]
struct RemoteEntry {
    data: Vec<u8>,
    thumbnail: Option<Vec<u8>>,
    version: VersionMarker,
}

#[derive(Default)]
struct RemoteState {
    entries: HashMap<NodeId, RemoteEntry>,
    fetch_log: Vec<NodeId>,
    failures: HashMap<NodeId, u32>,
    gates: HashMap<NodeId, watch::Sender<bool>>,
}

/// In-memory remote tree payload source.
///
/// Serves whatever was last published for a node. Fetches can be held at a
/// gate or made to fail, which lets tests pin down fetch ordering.
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
}

impl MemoryRemote {
    /// Create an empty remote.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish new data for a node under a fresh version marker.
    pub fn publish(&self, node_id: &NodeId, data: Vec<u8>) -> VersionMarker {
        let version = VersionMarker::new(Uuid::new_v4().to_string());
        self.publish_version(node_id, data, version.clone());
        version
    }

    /// Publish data for a node under a given version marker.
    pub fn publish_version(&self, node_id: &NodeId, data: Vec<u8>, version: VersionMarker) {
        let mut state = self.lock();
        let thumbnail = state.entries.get(node_id).and_then(|e| e.thumbnail.clone());
        state.entries.insert(
            node_id.clone(),
            RemoteEntry {
                data,
                thumbnail,
                version,
            },
        );
    }

    /// Attach a thumbnail to an already published node.
    pub fn publish_thumbnail(&self, node_id: &NodeId, thumbnail: Vec<u8>) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .entries
            .get_mut(node_id)
            .ok_or_else(|| Error::NotFound(format!("No remote data for node {}", node_id)))?;
        entry.thumbnail = Some(thumbnail);
        Ok(())
    }

    /// Remove a node's data.
    pub fn unpublish(&self, node_id: &NodeId) {
        self.lock().entries.remove(node_id);
    }

    /// Make the next `times` fetches of a node fail with a transport error.
    pub fn fail_next(&self, node_id: &NodeId, times: u32) {
        self.lock().failures.insert(node_id.clone(), times);
    }

    /// Hold fetches of a node until [`MemoryRemote::release`] is called.
    pub fn hold(&self, node_id: &NodeId) {
        let (tx, _) = watch::channel(false);
        self.lock().gates.insert(node_id.clone(), tx);
    }

    /// Let held fetches of a node proceed.
    pub fn release(&self, node_id: &NodeId) {
        if let Some(gate) = self.lock().gates.remove(node_id) {
            let _ = gate.send(true);
        }
    }

    /// Number of fetches issued for a node.
    pub fn fetch_count(&self, node_id: &NodeId) -> usize {
        self.lock().fetch_log.iter().filter(|id| *id == node_id).count()
    }

    /// Every fetch issued, in order.
    pub fn fetch_log(&self) -> Vec<NodeId> {
        self.lock().fetch_log.clone()
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DownloadService for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, node: &Node) -> Result<FetchedPayload> {
        let gate = {
            let mut state = self.lock();
            state.fetch_log.push(node.id.clone());
            state.gates.get(&node.id).map(|tx| tx.subscribe())
        };

        if let Some(mut gate) = gate {
            debug!(node_id = %node.id, "Fetch held at gate");
            // A dropped sender means the gate was released and removed.
            let _ = gate.wait_for(|open| *open).await;
        }

        let mut state = self.lock();
        if let Some(remaining) = state.failures.get_mut(&node.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Transport(format!(
                    "Injected failure fetching {}",
                    node.id
                )));
            }
        }

        let entry = state
            .entries
            .get(&node.id)
            .ok_or_else(|| Error::NotFound(format!("No remote data for node {}", node.id)))?;
        Ok(FetchedPayload {
            cleartext: SensitiveBytes::new(entry.data.clone()),
            version: entry.version.clone(),
        })
    }

    async fn fetch_thumbnail(&self, node: &Node) -> Result<Option<FetchedPayload>> {
        let state = self.lock();
        Ok(state.entries.get(&node.id).and_then(|entry| {
            entry.thumbnail.as_ref().map(|thumb| FetchedPayload {
                cleartext: SensitiveBytes::new(thumb.clone()),
                version: entry.version.clone(),
            })
        }))
    }
}
