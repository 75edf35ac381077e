//! Reconciliation controller.
//!
//! Reacts to remote tree events, drives the download scheduler, and turns
//! fetched payloads into linked local objects. Every mutation of the node
//! table, the link registry and the storage backend happens under a single
//! writer lock, so merges for the same node never race.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use arborsync_common::{
    ConflictKind, Error, LocalObject, Node, NodeChange, NodeId, ObjectKey, ObjectKind, Result,
    SensitiveBytes, TreePath, VersionMarker,
};
use arborsync_storage::{DownloadService, FetchedPayload, StorageBackend, WriteBatch};

use crate::changeset::{Changeset, ChangesetLog};
use crate::config::{DeletePolicy, ReconcilerConfig, LINKS_FILENAME, NODES_FILENAME};
use crate::event::{FetchOutcome, NodeState, Reachability, RemoteEvent};
use crate::link::LinkRegistry;
use crate::merge::{self, MergeKind, ObjectDraft};
use crate::policy::{ConflictAction, ConflictResolver};
use crate::scheduler::{DownloadScheduler, FetchCompletion, FetchTicket};
use crate::sweep::{SweepReason, SweepReport, SweepScanner, SweepTrigger};
use crate::tree::{NodeRecord, NodeTree};

/// Whether nodes at this depth are fetched without being asked for.
fn auto_fetched(depth: usize) -> bool {
    matches!(
        ObjectKind::from_depth(depth),
        Some(ObjectKind::Container | ObjectKind::Item)
    )
}

fn check_depth(record: &NodeRecord, path: &TreePath) {
    if path.depth() != record.depth {
        warn!(
            node_id = %record.id(),
            path = %path.to_string_path(),
            depth = record.depth,
            "Event path disagrees with tree depth"
        );
    }
}

/// State shared between the public handle and background tasks.
pub(crate) struct Shared {
    pub(crate) config: ReconcilerConfig,
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) links: LinkRegistry,
    pub(crate) tree: RwLock<NodeTree>,
    pub(crate) changesets: Mutex<ChangesetLog>,
    pub(crate) scheduler: DownloadScheduler,
    resolver: ConflictResolver,
    /// Held for every mutation of tree, links and storage.
    pub(crate) writer: Mutex<()>,
    online: AtomicBool,
}

impl Shared {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Request a fetch unless the network is known to be down.
    fn request(&self, node: &Node) -> Option<FetchTicket> {
        if !self.is_online() {
            debug!(node_id = %node.id, "Offline, leaving node for the next sweep");
            return None;
        }
        Some(self.scheduler.request_fetch(node))
    }

    /// Depth-based eligibility: containers always, items once their
    /// container is linked, attachments never.
    fn schedule_if_eligible(&self, record: &NodeRecord) -> Option<FetchTicket> {
        match ObjectKind::from_depth(record.depth) {
            Some(ObjectKind::Container) => self.request(&record.node),
            Some(ObjectKind::Item) => {
                let parent_linked = record
                    .node
                    .parent
                    .as_ref()
                    .is_some_and(|parent| self.links.is_linked(parent));
                if parent_linked {
                    self.request(&record.node)
                } else {
                    debug!(node_id = %record.id(), "Waiting for container to be linked");
                    None
                }
            }
            Some(ObjectKind::Attachment) | None => None,
        }
    }

    pub(crate) async fn persist(&self) -> Result<()> {
        let Some(dir) = &self.config.state_dir else {
            return Ok(());
        };
        self.tree.read().await.save(dir.join(NODES_FILENAME)).await?;
        self.links.save(dir.join(LINKS_FILENAME)).await
    }

    async fn run_completions(
        self: Arc<Self>,
        mut completions: mpsc::UnboundedReceiver<FetchCompletion>,
    ) {
        while let Some(completion) = completions.recv().await {
            let guard = self.scheduler.activity_guard();
            let shared = self.clone();
            tokio::spawn(async move {
                let _guard = guard;
                shared.finish_fetch(completion).await;
            });
        }
    }

    async fn finish_fetch(&self, completion: FetchCompletion) {
        let node_id = completion.node.id.clone();

        let requested = completion.node.version.as_ref();
        match self.process_fetched(&node_id, requested, completion.result).await {
            Ok(outcome) => debug!(node_id = %node_id, ?outcome, "Processed fetch"),
            Err(e @ Error::StaleFetch { .. }) => debug!(node_id = %node_id, "{}", e),
            Err(e) => warn!(node_id = %node_id, "Dropped fetch result: {}", e),
        }

        if self.scheduler.release(&node_id) {
            let record = self.tree.read().await.get(&node_id).cloned();
            if let Some(record) = record.filter(|r| r.needs_download) {
                debug!(node_id = %node_id, "Running follow-up fetch");
                self.schedule_if_eligible(&record);
            }
        }
    }

    /// Turn a fetched payload into a linked local object.
    ///
    /// `requested` is the marker the node had when the fetch was issued.
    /// If the node's marker moved since then, a newer fetch is due and the
    /// result is discarded. Otherwise the payload is accepted and its
    /// marker becomes the node's, even when the remote served something
    /// newer than the tree had heard about.
    pub(crate) async fn process_fetched(
        &self,
        node_id: &NodeId,
        requested: Option<&VersionMarker>,
        result: Result<FetchedPayload>,
    ) -> Result<FetchOutcome> {
        let fetched = result?;
        let writer = self.writer.lock().await;

        let Some(record) = self.tree.read().await.get(node_id).cloned() else {
            debug!(node_id = %node_id, "Fetched node no longer exists");
            return Ok(FetchOutcome::Dropped);
        };

        if record.node.version.as_ref() != requested {
            return Err(Error::StaleFetch {
                node_id: node_id.to_string(),
                expected: requested
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "<none>".to_string()),
                actual: record
                    .node
                    .version
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "<none>".to_string()),
            });
        }

        let kind = ObjectKind::from_depth(record.depth).ok_or_else(|| {
            Error::InvalidInput(format!("Root node {} carries no data", node_id))
        })?;

        let parent_key = match kind {
            ObjectKind::Container => None,
            ObjectKind::Item | ObjectKind::Attachment => {
                match record.node.parent.as_ref().and_then(|p| self.links.lookup(p)) {
                    Some(key) => Some(key),
                    None => {
                        debug!(node_id = %node_id, "Parent not linked yet, deferring");
                        return Ok(FetchOutcome::Deferred);
                    }
                }
            }
        };

        let payload = merge::decode(fetched.cleartext.as_bytes(), kind)?;

        let existing_key = self.links.lookup(node_id);
        let mut changesets = self.changesets.lock().await;
        let pending: Option<Changeset> = existing_key
            .as_ref()
            .and_then(|key| changesets.get(key))
            .cloned();

        // A conflict refetch always rewrites the object: local state may
        // have been replaced wholesale without any field edits.
        let has_edits = pending.as_ref().is_some_and(|c| c.has_edits());
        if existing_key.is_some()
            && !has_edits
            && !record.conflicted
            && record.merged_version.as_ref() == Some(&fetched.version)
        {
            self.tree.write().await.mark_merged(node_id, &fetched.version);
            self.persist().await?;
            return Ok(FetchOutcome::Unchanged);
        }

        let existing = match &existing_key {
            Some(key) => self.storage.get(key).await?,
            None => None,
        };
        let draft = ObjectDraft {
            parent: parent_key.as_ref().map(|key| key.id.clone()),
            payload,
        };
        let outcome = merge::reconcile(draft, existing.as_ref(), pending.as_ref());
        let object_key = outcome.object.key();

        let mut batch = WriteBatch::new();
        batch.put(outcome.object.clone());
        if let Some(parent_key) = &parent_key {
            batch.touch(parent_key.clone());
        }

        let relinked = match &existing_key {
            None => {
                self.links.link(node_id, kind, &outcome.object.id)?;
                true
            }
            Some(old) if old != &object_key => {
                batch.remove(old.clone());
                self.links.unlink_node(node_id);
                self.links.link(node_id, kind, &outcome.object.id)?;
                true
            }
            Some(_) => false,
        };

        if let Err(e) = self.storage.commit(batch).await {
            error!(node_id = %node_id, "Failed to store fetched object: {}", e);
            if relinked {
                self.links.unlink_node(node_id);
                if let Some(old) = &existing_key {
                    self.links.link(node_id, old.kind, &old.id)?;
                }
            }
            return Err(e);
        }

        if let Some(old) = existing_key.as_ref().filter(|old| *old != &object_key) {
            changesets.clear(old).await?;
        }
        if pending.is_some() {
            changesets.clear(&object_key).await?;
        }
        drop(changesets);

        self.tree.write().await.mark_merged(node_id, &fetched.version);
        self.persist().await?;
        drop(writer);

        if kind == ObjectKind::Container {
            self.sweep_children(node_id).await;
        }

        Ok(match outcome.kind {
            MergeKind::Created => FetchOutcome::Created(object_key),
            MergeKind::Replaced => FetchOutcome::Replaced(object_key),
            MergeKind::Merged { .. } => FetchOutcome::Merged(object_key),
            MergeKind::FellBack { .. } => FetchOutcome::FellBack(object_key),
        })
    }

    /// Re-run eligibility for a container's children still waiting for it.
    async fn sweep_children(&self, container: &NodeId) {
        let waiting: Vec<NodeRecord> = {
            let tree = self.tree.read().await;
            tree.children(container)
                .iter()
                .filter_map(|child| tree.get(child))
                .filter(|record| record.needs_download)
                .cloned()
                .collect()
        };

        if !waiting.is_empty() {
            debug!(container = %container, children = waiting.len(), "Scheduling dependent items");
        }
        for record in &waiting {
            self.schedule_if_eligible(record);
        }
    }

    pub(crate) async fn sweep(&self, reason: SweepReason) -> Result<SweepReport> {
        let started = Instant::now();
        let plan = {
            let tree = self.tree.read().await;
            SweepScanner::scan(&tree, &self.links)
        };

        let requeued = plan
            .fetch
            .iter()
            .filter_map(|node| self.request(node))
            .count();

        let report = SweepReport {
            reason,
            visited: plan.visited,
            requeued,
            pruned: plan.pruned,
            duration: started.elapsed(),
        };
        info!(
            ?reason,
            visited = report.visited,
            requeued = report.requeued,
            pruned = report.pruned,
            "Sweep completed"
        );
        Ok(report)
    }

    async fn handle(&self, event: RemoteEvent) -> Result<()> {
        match event {
            RemoteEvent::Discovered { node, path } => self.on_discover(node, &path).await,
            RemoteEvent::Modified { node, change, path } => {
                self.on_modify(node, change, &path).await
            }
            RemoteEvent::Moved { node, from, to } => self.on_move(node, &from, &to).await,
            RemoteEvent::Deleted {
                node,
                path,
                timestamp,
            } => self.on_delete(node, &path, timestamp).await,
            RemoteEvent::Conflict {
                node,
                path,
                conflict,
            } => self.on_conflict(node, &path, conflict).await,
        }
    }

    async fn on_discover(&self, node: Node, path: &TreePath) -> Result<()> {
        let _writer = self.writer.lock().await;
        let record = {
            let mut tree = self.tree.write().await;
            let record = tree.upsert(node)?;
            check_depth(record, path);

            let up_to_date = record.merged_version.is_some()
                && record.merged_version == record.node.version
                && self.links.is_linked(record.id());
            if auto_fetched(record.depth) && !up_to_date {
                record.needs_download = true;
            }
            record.clone()
        };
        self.persist().await?;

        debug!(node_id = %record.id(), depth = record.depth, "Discovered node");
        if record.needs_download {
            self.schedule_if_eligible(&record);
        }
        Ok(())
    }

    async fn on_modify(&self, node: Node, change: NodeChange, path: &TreePath) -> Result<()> {
        let _writer = self.writer.lock().await;
        let record = {
            let mut tree = self.tree.write().await;
            let record = tree.upsert(node)?;
            check_depth(record, path);
            if change == NodeChange::Data && auto_fetched(record.depth) {
                record.needs_download = true;
            }
            record.clone()
        };
        self.persist().await?;

        debug!(node_id = %record.id(), ?change, "Node modified");
        if record.needs_download && change == NodeChange::Data {
            self.schedule_if_eligible(&record);
        } else if let Some(key) = self.links.lookup(record.id()) {
            self.storage.touch(&key).await?;
        }
        Ok(())
    }

    async fn on_move(&self, node: Node, from: &TreePath, to: &TreePath) -> Result<()> {
        let _writer = self.writer.lock().await;
        let (record, old_depth) = {
            let mut tree = self.tree.write().await;
            let old_depth = tree.get(&node.id).map(|r| r.depth);
            let record = tree.upsert(node)?;
            check_depth(record, to);
            (record.clone(), old_depth)
        };
        debug!(
            node_id = %record.id(),
            from = %from.to_string_path(),
            to = %to.to_string_path(),
            "Node moved"
        );

        let kind = ObjectKind::from_depth(record.depth);
        if old_depth.is_some_and(|old| ObjectKind::from_depth(old) != kind) {
            warn!(node_id = %record.id(), "Move changed the node's kind, refetching");
            if auto_fetched(record.depth) {
                if let Some(r) = self.tree.write().await.get_mut(record.id()) {
                    r.needs_download = true;
                }
                self.schedule_if_eligible(&record);
            }
            return self.persist().await;
        }

        // Items and attachments remember their owning aggregate.
        if let (Some(key), Some(parent)) = (self.links.lookup(record.id()), &record.node.parent) {
            if key.kind != ObjectKind::Container {
                if let Some(parent_key) = self.links.lookup(parent) {
                    self.reparent(&key, &parent_key).await?;
                }
            }
        }
        self.persist().await
    }

    async fn reparent(&self, key: &ObjectKey, parent_key: &ObjectKey) -> Result<()> {
        let Some(object) = self.storage.get(key).await? else {
            return Ok(());
        };
        if object.parent.as_ref() == Some(&parent_key.id) {
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        if let Some(old_parent) = &object.parent {
            batch.touch(ObjectKey::new(parent_key.kind, old_parent.clone()));
        }
        batch.touch(parent_key.clone());
        batch.put(LocalObject {
            parent: Some(parent_key.id.clone()),
            ..object
        });
        self.storage.commit(batch).await
    }

    async fn on_delete(
        &self,
        node: Node,
        path: &TreePath,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let _writer = self.writer.lock().await;

        // Nothing changes in memory until the storage commit went through.
        let (subtree, parent) = {
            let tree = self.tree.read().await;
            let subtree: Vec<NodeId> = tree
                .subtree(&node.id)
                .iter()
                .map(|r| r.id().clone())
                .collect();
            let parent = tree.get(&node.id).and_then(|r| r.node.parent.clone());
            (subtree, parent)
        };
        if subtree.is_empty() {
            debug!(node_id = %node.id, "Delete for unknown node");
            return Ok(());
        }

        let parent_key = parent.as_ref().and_then(|p| self.links.lookup(p));
        let cascade = self.config.delete_policy == DeletePolicy::Cascade;
        let linked: Vec<ObjectKey> = subtree
            .iter()
            .filter_map(|id| self.links.lookup(id))
            .collect();

        let mut batch = WriteBatch::new();
        if cascade {
            for key in &linked {
                batch.remove(key.clone());
            }
        }
        if let Some(parent_key) = parent_key {
            batch.touch(parent_key);
        }

        if let Err(e) = self.storage.commit(batch).await {
            error!(node_id = %node.id, "Failed to apply remote delete: {}", e);
            return Err(e);
        }

        let removed = self.tree.write().await.remove_subtree(&node.id);
        for id in &subtree {
            self.links.unlink_node(id);
        }
        if cascade {
            let mut changesets = self.changesets.lock().await;
            for key in &linked {
                changesets.clear(key).await?;
            }
        }
        self.persist().await?;

        info!(
            node_id = %node.id,
            path = %path.to_string_path(),
            removed = removed.len(),
            deleted_at = ?timestamp,
            policy = ?self.config.delete_policy,
            "Applied remote delete"
        );
        Ok(())
    }

    async fn on_conflict(&self, node: Node, path: &TreePath, conflict: ConflictKind) -> Result<()> {
        let _writer = self.writer.lock().await;
        let record = self.tree.write().await.upsert(node)?.clone();
        let kind = ObjectKind::from_depth(record.depth);
        let key = self.links.lookup(record.id());

        match self.resolver.resolve(conflict, kind) {
            ConflictAction::Ignore => {
                debug!(
                    node_id = %record.id(),
                    path = %path.to_string_path(),
                    ?conflict,
                    "Conflict needs no local action"
                );
            }
            ConflictAction::SkipUpload => {
                if let Some(key) = &key {
                    self.changesets.lock().await.skip_uploads(key).await?;
                }
                info!(node_id = %record.id(), "Skipped upload after data conflict");
            }
            ConflictAction::Refetch { discard_local } => {
                if discard_local {
                    if let Some(key) = &key {
                        self.changesets.lock().await.skip_uploads(key).await?;
                    }
                }
                if let Some(r) = self.tree.write().await.get_mut(record.id()) {
                    r.conflicted = true;
                    r.needs_download = true;
                }
                self.persist().await?;
                info!(node_id = %record.id(), discard_local, "Refetching after data conflict");
                self.request(&record.node);
            }
        }
        Ok(())
    }

    async fn node_state(&self, node_id: &NodeId) -> NodeState {
        let tree = self.tree.read().await;
        let Some(record) = tree.get(node_id) else {
            return if tree.is_tombstoned(node_id) {
                NodeState::Deleted
            } else {
                NodeState::Unknown
            };
        };

        if record.conflicted {
            NodeState::Conflicted
        } else if self.scheduler.is_in_flight(node_id) {
            NodeState::Downloading
        } else if self.links.is_linked(node_id) {
            if record.needs_download {
                NodeState::ModifiedPendingDownload
            } else {
                NodeState::Linked
            }
        } else {
            NodeState::Discovered
        }
    }
}

/// Reconciliation controller.
///
/// Created once when the local store is unlocked and torn down with
/// [`Reconciler::shutdown`] when it is locked again.
pub struct Reconciler {
    pub(crate) shared: Arc<Shared>,
    trigger: SweepTrigger,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Reconciler {
    /// Create the reconciler for an unlocked store.
    ///
    /// Persisted node, link and changeset state is loaded from the
    /// configured state directory.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Persisted state cannot be read
    pub async fn unlock(
        config: ReconcilerConfig,
        storage: Arc<dyn StorageBackend>,
        download: Arc<dyn DownloadService>,
    ) -> Result<Self> {
        config.validate()?;

        let (tree, links, changesets) = match &config.state_dir {
            Some(dir) => {
                let changesets = ChangesetLog::open(dir).await?;
                (
                    NodeTree::load(dir.join(NODES_FILENAME)).await?,
                    LinkRegistry::load(dir.join(LINKS_FILENAME)).await?,
                    changesets,
                )
            }
            None => (NodeTree::new(), LinkRegistry::new(), ChangesetLog::in_memory()),
        };

        info!(
            storage = storage.name(),
            download = download.name(),
            nodes = tree.len(),
            links = links.len(),
            pending = changesets.len(),
            "Reconciler unlocked"
        );

        let (scheduler, completions) =
            DownloadScheduler::new(download, config.max_concurrent_fetches);
        let (trigger, sweep_loop) = SweepTrigger::new(config.sweep_mode.clone());

        let shared = Arc::new(Shared {
            resolver: ConflictResolver::new(config.conflict_policies),
            config,
            storage,
            links,
            tree: RwLock::new(tree),
            changesets: Mutex::new(changesets),
            scheduler,
            writer: Mutex::new(()),
            online: AtomicBool::new(true),
        });

        let completion_task = tokio::spawn(shared.clone().run_completions(completions));
        let sweep_task = {
            let shared = shared.clone();
            tokio::spawn(sweep_loop.run(move |reason| {
                let shared = shared.clone();
                async move { shared.sweep(reason).await }
            }))
        };

        Ok(Self {
            shared,
            trigger,
            tasks: StdMutex::new(vec![completion_task, sweep_task]),
        })
    }

    /// Run the startup sweep.
    pub async fn start(&self) -> Result<SweepReport> {
        self.trigger.request(SweepReason::Startup).await
    }

    /// Apply a remote event.
    ///
    /// # Errors
    /// - `NotFound` if the node's parent is unknown
    /// - Storage or persistence failures
    pub async fn handle(&self, event: RemoteEvent) -> Result<()> {
        self.shared.handle(event).await
    }

    /// Run a sweep now and wait for its report.
    pub async fn request_sweep(&self) -> Result<SweepReport> {
        self.trigger.request(SweepReason::Requested).await
    }

    /// Report a change in network reachability.
    ///
    /// Going from offline to online triggers a sweep.
    pub fn notify_reachability(&self, reachability: Reachability) {
        let online = reachability == Reachability::Online;
        let was_online = self.shared.online.swap(online, Ordering::SeqCst);

        if online && !was_online {
            info!("Connectivity restored, sweeping");
            self.trigger.notify(SweepReason::Reconnected);
        } else if !online && was_online {
            info!("Connectivity lost, pausing fetches");
        }
    }

    /// Whether fetches are currently issued.
    pub fn is_online(&self) -> bool {
        self.shared.is_online()
    }

    /// Sync state of a node.
    pub async fn node_state(&self, node_id: &NodeId) -> NodeState {
        self.shared.node_state(node_id).await
    }

    /// Node record with its sync bookkeeping.
    pub async fn node(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.shared.tree.read().await.get(node_id).cloned()
    }

    /// Local object linked to a node.
    pub async fn linked_object(&self, node_id: &NodeId) -> Result<Option<LocalObject>> {
        match self.shared.links.lookup(node_id) {
            Some(key) => self.shared.storage.get(&key).await,
            None => Ok(None),
        }
    }

    /// Pending changeset of an object.
    pub async fn pending_changeset(&self, key: &ObjectKey) -> Option<Changeset> {
        self.shared.changesets.lock().await.get(key).cloned()
    }

    /// Fetch an attachment on demand and store it.
    ///
    /// # Errors
    /// - `NotFound` if the node is unknown or its item is not linked
    /// - `InvalidInput` if the node is not an attachment
    /// - Transport, decode and stale-fetch errors
    pub async fn fetch_attachment(&self, node_id: &NodeId) -> Result<LocalObject> {
        let node = self.attachment_node(node_id).await?;
        let result = self.shared.scheduler.service().fetch(&node).await;

        match self
            .shared
            .process_fetched(node_id, node.version.as_ref(), result)
            .await?
        {
            FetchOutcome::Deferred => {
                return Err(Error::NotFound(format!(
                    "Item owning attachment {} is not linked",
                    node_id
                )))
            }
            FetchOutcome::Dropped => {
                return Err(Error::NotFound(format!("Node {} was deleted", node_id)))
            }
            _ => {}
        }

        self.linked_object(node_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No object linked to node {}", node_id)))
    }

    /// Fetch an attachment's thumbnail. Nothing is stored.
    pub async fn fetch_thumbnail(&self, node_id: &NodeId) -> Result<Option<SensitiveBytes>> {
        let node = self.attachment_node(node_id).await?;
        let thumbnail = self.shared.scheduler.service().fetch_thumbnail(&node).await?;
        Ok(thumbnail.map(|t| t.cleartext))
    }

    async fn attachment_node(&self, node_id: &NodeId) -> Result<Node> {
        let tree = self.shared.tree.read().await;
        let record = tree
            .get(node_id)
            .ok_or_else(|| Error::NotFound(format!("Unknown node {}", node_id)))?;
        if ObjectKind::from_depth(record.depth) != Some(ObjectKind::Attachment) {
            return Err(Error::InvalidInput(format!(
                "Node {} is not an attachment",
                node_id
            )));
        }
        Ok(record.node.clone())
    }

    /// Wait until no fetch is in flight or being merged.
    pub async fn wait_idle(&self) {
        self.shared.scheduler.wait_idle().await;
    }

    /// Get the link registry.
    pub fn links(&self) -> &LinkRegistry {
        &self.shared.links
    }

    /// Get the storage backend.
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.shared.storage
    }

    /// Get the configuration.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.shared.config
    }

    /// Stop background work and flush persisted state.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.scheduler.close();
        self.abort_tasks();

        let _writer = self.shared.writer.lock().await;
        self.shared.persist().await?;
        info!("Reconciler shut down");
        Ok(())
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
