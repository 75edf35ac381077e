//! Shared harness for reconciliation scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use arborsync_common::{
    ConflictKind, ContainerData, Error, ItemData, LocalObject, Node, NodeChange, NodeId,
    ObjectKey, ObjectKind, Payload, Result, TreePath, UserId,
};
use arborsync_storage::{
    DownloadService, MemoryBackend, MemoryRemote, StorageBackend, StorageEvent, WriteBatch,
};
use arborsync_sync::{merge, Reconciler, ReconcilerConfig, RemoteEvent, ATTACHMENT_NODE_NAME};

pub fn id(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

pub fn user(s: &str) -> UserId {
    UserId::new(s).unwrap()
}

pub fn container_payload(name: &str) -> Payload {
    Payload::Container(ContainerData {
        name: name.to_string(),
    })
}

pub fn item_payload(title: &str) -> Payload {
    Payload::Item(ItemData::new(title))
}

/// Memory backend whose commits can be switched to fail.
pub struct FailingBackend {
    inner: Arc<MemoryBackend>,
    failing: AtomicBool,
}

impl FailingBackend {
    pub fn new(inner: Arc<MemoryBackend>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn fail_commits(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing-memory"
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<LocalObject>> {
        self.inner.get(key).await
    }

    async fn list(&self, kind: ObjectKind) -> Result<Vec<LocalObject>> {
        self.inner.list(kind).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk full".to_string()));
        }
        self.inner.commit(batch).await
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.subscribe()
    }
}

/// A reconciler wired to an in-memory store and remote, with alice's root
/// already discovered.
pub struct Harness {
    pub reconciler: Reconciler,
    pub storage: Arc<MemoryBackend>,
    /// The store the reconciler writes through.
    pub backend: Arc<FailingBackend>,
    pub remote: Arc<MemoryRemote>,
    pub user: UserId,
    pub root: Node,
    paths: Mutex<HashMap<NodeId, TreePath>>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(ReconcilerConfig::default()).await
    }

    pub async fn with_config(config: ReconcilerConfig) -> Self {
        Self::open(
            config,
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryRemote::new()),
        )
        .await
    }

    /// Unlock a reconciler over existing storage and remote.
    pub async fn open(
        config: ReconcilerConfig,
        storage: Arc<MemoryBackend>,
        remote: Arc<MemoryRemote>,
    ) -> Self {
        let download: Arc<dyn DownloadService> = remote.clone();
        Self::open_with_download(config, storage, remote, download).await
    }

    /// Unlock a reconciler that fetches from `remote` through `download`.
    pub async fn open_with_download(
        config: ReconcilerConfig,
        storage: Arc<MemoryBackend>,
        remote: Arc<MemoryRemote>,
        download: Arc<dyn DownloadService>,
    ) -> Self {
        let backend = Arc::new(FailingBackend::new(storage.clone()));
        let reconciler = Reconciler::unlock(config, backend.clone(), download)
            .await
            .unwrap();
        let user = user("alice");
        let root = Node::root(id("alice-home"), user.clone());

        let harness = Self {
            reconciler,
            storage,
            backend,
            remote,
            user,
            root: root.clone(),
            paths: Mutex::new(HashMap::new()),
        };
        harness.discover(&root).await;
        harness
    }

    /// Publish a container below the root and return its node.
    pub fn container(&self, node_id: &str, name: &str) -> Node {
        self.publish_child(node_id, &self.root, name, &container_payload(name))
    }

    /// Publish an item below a container and return its node.
    pub fn item(&self, node_id: &str, container: &Node, title: &str) -> Node {
        self.publish_child(node_id, container, title, &item_payload(title))
    }

    /// Publish an attachment below an item and return its node.
    pub fn attachment(&self, node_id: &str, item: &Node, bytes: &[u8]) -> Node {
        let node = Node::child(
            id(node_id),
            self.user.clone(),
            item.id.clone(),
            ATTACHMENT_NODE_NAME,
            None,
        );
        let version = self.remote.publish(&node.id, bytes.to_vec());
        Node {
            version: Some(version),
            ..node
        }
    }

    fn publish_child(&self, node_id: &str, parent: &Node, name: &str, payload: &Payload) -> Node {
        let node = Node::child(id(node_id), self.user.clone(), parent.id.clone(), name, None);
        self.republish(&node, payload)
    }

    /// Publish a new remote version of a node's data.
    pub fn republish(&self, node: &Node, payload: &Payload) -> Node {
        let version = self
            .remote
            .publish(&node.id, merge::encode(payload).unwrap());
        Node {
            version: Some(version),
            ..node.clone()
        }
    }

    fn path_for(&self, node: &Node) -> TreePath {
        let mut paths = self.paths.lock().unwrap();
        let path = match &node.parent {
            None => TreePath::root(),
            Some(parent) => paths
                .get(parent)
                .cloned()
                .unwrap_or_else(TreePath::root)
                .join(&node.name)
                .unwrap(),
        };
        paths.insert(node.id.clone(), path.clone());
        path
    }

    pub async fn discover(&self, node: &Node) {
        let path = self.path_for(node);
        self.reconciler
            .handle(RemoteEvent::Discovered {
                node: node.clone(),
                path,
            })
            .await
            .unwrap();
    }

    pub async fn modify(&self, node: &Node, change: NodeChange) {
        let path = self.path_for(node);
        self.reconciler
            .handle(RemoteEvent::Modified {
                node: node.clone(),
                change,
                path,
            })
            .await
            .unwrap();
    }

    pub async fn move_to(&self, node: &Node) {
        let from = self
            .paths
            .lock()
            .unwrap()
            .get(&node.id)
            .cloned()
            .unwrap_or_else(TreePath::root);
        let to = self.path_for(node);
        self.reconciler
            .handle(RemoteEvent::Moved {
                node: node.clone(),
                from,
                to,
            })
            .await
            .unwrap();
    }

    pub async fn delete(&self, node: &Node) {
        self.try_delete(node).await.unwrap();
    }

    pub async fn try_delete(&self, node: &Node) -> Result<()> {
        let path = self.path_for(node);
        self.reconciler
            .handle(RemoteEvent::Deleted {
                node: node.clone(),
                path,
                timestamp: Some(chrono::Utc::now()),
            })
            .await
    }

    pub async fn conflict(&self, node: &Node, conflict: ConflictKind) {
        let path = self.path_for(node);
        self.reconciler
            .handle(RemoteEvent::Conflict {
                node: node.clone(),
                path,
                conflict,
            })
            .await
            .unwrap();
    }

    /// Wait for all fetches and merges to finish.
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.reconciler.wait_idle())
            .await
            .expect("reconciler did not settle");
    }

    /// Poll until a node is linked.
    pub async fn wait_linked(&self, node_id: &NodeId) {
        for _ in 0..500 {
            if self.reconciler.links().is_linked(node_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node {} was never linked", node_id);
    }

    pub fn key(&self, node_id: &NodeId) -> ObjectKey {
        self.reconciler.links().lookup(node_id).unwrap()
    }

    pub async fn object(&self, node_id: &NodeId) -> LocalObject {
        self.reconciler.linked_object(node_id).await.unwrap().unwrap()
    }

    pub async fn item_data(&self, node_id: &NodeId) -> ItemData {
        match self.object(node_id).await.payload {
            Payload::Item(data) => data,
            other => panic!("expected an item, got {:?}", other),
        }
    }

    pub async fn stored(&self, key: &ObjectKey) -> Option<LocalObject> {
        self.storage.get(key).await.unwrap()
    }
}
