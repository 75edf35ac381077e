//! Sweep scanner: finds nodes still needing download and re-drives fetches.
//!
//! The scan itself is a pure walk over the node table. The trigger loop
//! decides when a sweep runs: on startup, when connectivity returns, on a
//! timer in periodic mode, and on explicit request.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, error, info};

use arborsync_common::{Error, Node, ObjectKind, Result};

use crate::config::SweepMode;
use crate::link::LinkRegistry;
use crate::tree::NodeTree;

/// Why a sweep ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepReason {
    Startup,
    Reconnected,
    Periodic,
    Requested,
}

/// Summary of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub reason: SweepReason,
    /// Nodes visited by the walk.
    pub visited: usize,
    /// Fetch requests issued or coalesced.
    pub requeued: usize,
    /// Subtrees skipped because their node has no link yet.
    pub pruned: usize,
    pub duration: Duration,
}

/// Nodes a sweep should fetch, in parent-before-child order.
#[derive(Debug, Default)]
pub struct SweepPlan {
    pub fetch: Vec<Node>,
    pub visited: usize,
    pub pruned: usize,
}

/// Sweep scanner.
pub struct SweepScanner;

impl SweepScanner {
    /// Walk every user's tree and collect nodes flagged for download.
    ///
    /// Children are visited only below linked nodes, so an item is never
    /// queued while its container is missing locally. Attachments are left
    /// to on-demand retrieval.
    pub fn scan(tree: &NodeTree, links: &LinkRegistry) -> SweepPlan {
        let mut plan = SweepPlan::default();

        for user in tree.users() {
            let Some(root) = tree.root(&user) else {
                continue;
            };

            // Depth-first with the stack reversed per level keeps parents
            // ahead of their children.
            let mut stack = vec![root.clone()];
            while let Some(id) = stack.pop() {
                let Some(record) = tree.get(&id) else {
                    continue;
                };
                plan.visited += 1;

                let kind = ObjectKind::from_depth(record.depth);
                if record.needs_download && matches!(kind, Some(ObjectKind::Container | ObjectKind::Item)) {
                    plan.fetch.push(record.node.clone());
                }

                let descend = kind.is_none() || links.is_linked(&id);
                let children = tree.children(&id);
                if !descend {
                    if !children.is_empty() {
                        plan.pruned += 1;
                    }
                    continue;
                }
                stack.extend(children.into_iter().rev());
            }
        }

        plan
    }
}

type SweepRequest = (SweepReason, Option<oneshot::Sender<Result<SweepReport>>>);

/// Handle for requesting sweeps.
#[derive(Clone)]
pub struct SweepTrigger {
    request_tx: mpsc::Sender<SweepRequest>,
}

/// Background loop that runs sweeps.
pub struct SweepLoop {
    mode: SweepMode,
    request_rx: mpsc::Receiver<SweepRequest>,
}

impl SweepTrigger {
    /// Create a trigger and the loop it feeds.
    pub fn new(mode: SweepMode) -> (Self, SweepLoop) {
        let (request_tx, request_rx) = mpsc::channel(32);
        (Self { request_tx }, SweepLoop { mode, request_rx })
    }

    /// Run a sweep and wait for its report.
    pub async fn request(&self, reason: SweepReason) -> Result<SweepReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send((reason, Some(response_tx)))
            .await
            .map_err(|_| Error::Shutdown)?;
        response_rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Ask for a sweep without waiting for it.
    ///
    /// Dropped if a backlog of requests is already queued.
    pub fn notify(&self, reason: SweepReason) {
        if self.request_tx.try_send((reason, None)).is_err() {
            debug!(?reason, "Sweep already queued, dropping trigger");
        }
    }
}

impl SweepLoop {
    /// Run until every trigger handle is dropped.
    ///
    /// Should be spawned in a tokio task.
    pub async fn run<F, Fut>(mut self, sweep_fn: F)
    where
        F: Fn(SweepReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SweepReport>> + Send,
    {
        let mut periodic = match &self.mode {
            SweepMode::Periodic { interval } => {
                Some(interval_at(Instant::now() + *interval, *interval))
            }
            SweepMode::Manual => None,
        };

        info!(mode = ?self.mode, "Sweep loop started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some((reason, response_tx)) = request else {
                        info!("Sweep loop shutting down");
                        break;
                    };
                    let result = sweep_fn(reason).await;
                    if let Err(e) = &result {
                        error!(?reason, "Sweep failed: {}", e);
                    }
                    if let Some(response_tx) = response_tx {
                        let _ = response_tx.send(result);
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    debug!("Triggering periodic sweep");
                    if let Err(e) = sweep_fn(SweepReason::Periodic).await {
                        error!("Periodic sweep failed: {}", e);
                    }
                }
            }
        }
    }

    async fn wait_for_periodic(interval: &mut Option<Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arborsync_common::{LocalId, NodeId, UserId, VersionMarker};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn add(tree: &mut NodeTree, user: &str, node: &str, parent: Option<&str>, flagged: bool) {
        let owner = UserId::new(user).unwrap();
        let n = match parent {
            None => Node::root(id(node), owner),
            Some(parent) => Node::child(
                id(node),
                owner,
                id(parent),
                node,
                Some(VersionMarker::new("v1")),
            ),
        };
        tree.upsert(n).unwrap();
        if flagged {
            tree.mark_needs_download(&id(node));
        }
    }

    fn link(links: &LinkRegistry, node: &str, kind: ObjectKind) {
        links.link(&id(node), kind, &LocalId::generate()).unwrap();
    }

    fn report(reason: SweepReason) -> SweepReport {
        SweepReport {
            reason,
            visited: 0,
            requeued: 0,
            pruned: 0,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_scan_prunes_unlinked_containers() {
        let mut tree = NodeTree::new();
        let links = LinkRegistry::new();
        add(&mut tree, "alice", "home", None, false);
        add(&mut tree, "alice", "groceries", Some("home"), false);
        add(&mut tree, "alice", "milk", Some("groceries"), true);
        add(&mut tree, "alice", "chores", Some("home"), true);
        add(&mut tree, "alice", "dishes", Some("chores"), true);
        link(&links, "groceries", ObjectKind::Container);

        let plan = SweepScanner::scan(&tree, &links);
        let ids: Vec<_> = plan.fetch.iter().map(|n| n.id.clone()).collect();

        assert!(ids.contains(&id("milk")));
        assert!(ids.contains(&id("chores")));
        assert!(!ids.contains(&id("dishes")));
        assert_eq!(plan.pruned, 1);
        assert_eq!(plan.visited, 4);
    }

    #[test]
    fn test_scan_orders_parents_first() {
        let mut tree = NodeTree::new();
        let links = LinkRegistry::new();
        add(&mut tree, "alice", "home", None, false);
        add(&mut tree, "alice", "list", Some("home"), true);
        add(&mut tree, "alice", "task", Some("list"), true);
        link(&links, "list", ObjectKind::Container);

        let plan = SweepScanner::scan(&tree, &links);
        let ids: Vec<_> = plan.fetch.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec![id("list"), id("task")]);
    }

    #[test]
    fn test_scan_covers_every_user_and_skips_attachments() {
        let mut tree = NodeTree::new();
        let links = LinkRegistry::new();
        add(&mut tree, "alice", "a-home", None, false);
        add(&mut tree, "alice", "a-list", Some("a-home"), true);
        add(&mut tree, "bob", "b-home", None, false);
        add(&mut tree, "bob", "b-list", Some("b-home"), false);
        add(&mut tree, "bob", "b-task", Some("b-list"), false);
        add(&mut tree, "bob", "img", Some("b-task"), true);
        link(&links, "b-list", ObjectKind::Container);
        link(&links, "b-task", ObjectKind::Item);

        let plan = SweepScanner::scan(&tree, &links);
        let ids: Vec<_> = plan.fetch.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec![id("a-list")]);
        assert_eq!(plan.visited, 6);
    }

    #[tokio::test]
    async fn test_request_runs_sweep() {
        let (trigger, sweep_loop) = SweepTrigger::new(SweepMode::Manual);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let task = tokio::spawn(sweep_loop.run(move |reason| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(report(reason))
            }
        }));

        let result = trigger.request(SweepReason::Requested).await.unwrap();
        assert_eq!(result.reason, SweepReason::Requested);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        drop(trigger);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_sweeps() {
        let (trigger, sweep_loop) = SweepTrigger::new(SweepMode::Periodic {
            interval: Duration::from_millis(10),
        });
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let task = tokio::spawn(sweep_loop.run(move |reason| {
            let counter = counter.clone();
            async move {
                if reason == SweepReason::Periodic {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(report(reason))
            }
        }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);

        drop(trigger);
        task.await.unwrap();
    }
}
