//! Download scheduler.
//!
//! Issues fetches through the download service with at most one fetch in
//! flight per node. Completed fetches are handed to the controller over a
//! channel. A request for a node that is already being fetched is coalesced;
//! if it asked for a newer version than the running fetch, a follow-up is
//! recorded and reported when the slot is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::debug;

use arborsync_common::{Error, Node, NodeId, Result, VersionMarker};
use arborsync_storage::{DownloadService, FetchedPayload};

/// Result of a fetch, delivered to the controller.
#[derive(Debug)]
pub struct FetchCompletion {
    /// Node as it was when the fetch was issued.
    pub node: Node,
    pub result: Result<FetchedPayload>,
}

/// What a fetch request turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTicket {
    /// A new fetch was started.
    Issued,
    /// A fetch for the node was already running.
    Coalesced,
}

#[derive(Debug)]
struct InFlight {
    requested: Option<VersionMarker>,
    follow_up: bool,
}

/// Count of outstanding work. Drops back to zero when the engine is idle.
#[derive(Clone)]
struct Activity(Arc<watch::Sender<usize>>);

impl Activity {
    fn enter(&self) {
        self.0.send_modify(|n| *n += 1);
    }

    fn leave(&self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Keeps the scheduler non-idle while a completion is being processed.
pub struct ActivityGuard {
    activity: Activity,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.activity.leave();
    }
}

/// Download scheduler.
pub struct DownloadScheduler {
    service: Arc<dyn DownloadService>,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashMap<NodeId, InFlight>>,
    completions: mpsc::UnboundedSender<FetchCompletion>,
    activity: Activity,
    issued: AtomicU64,
}

impl DownloadScheduler {
    /// Create a scheduler and the receiving end of its completion channel.
    pub fn new(
        service: Arc<dyn DownloadService>,
        max_concurrent: usize,
    ) -> (Self, mpsc::UnboundedReceiver<FetchCompletion>) {
        let (completions, rx) = mpsc::unbounded_channel();
        let (activity, _) = watch::channel(0usize);

        let scheduler = Self {
            service,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Mutex::new(HashMap::new()),
            completions,
            activity: Activity(Arc::new(activity)),
            issued: AtomicU64::new(0),
        };
        (scheduler, rx)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<NodeId, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request a fetch of a node.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request_fetch(&self, node: &Node) -> FetchTicket {
        {
            let mut in_flight = self.in_flight();
            if let Some(running) = in_flight.get_mut(&node.id) {
                if running.requested != node.version {
                    running.follow_up = true;
                }
                debug!(node_id = %node.id, "Coalesced fetch request");
                return FetchTicket::Coalesced;
            }
            in_flight.insert(
                node.id.clone(),
                InFlight {
                    requested: node.version.clone(),
                    follow_up: false,
                },
            );
            self.activity.enter();
        }

        self.issued.fetch_add(1, Ordering::Relaxed);
        debug!(node_id = %node.id, "Issuing fetch");

        let service = self.service.clone();
        let permits = self.permits.clone();
        let completions = self.completions.clone();
        let activity = self.activity.clone();
        let node = node.clone();

        tokio::spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => service.fetch(&node).await,
                Err(_) => Err(Error::Shutdown),
            };

            if let Err(e) = &result {
                debug!(node_id = %node.id, "Fetch failed: {}", e);
            }

            if let Err(mpsc::error::SendError(completion)) =
                completions.send(FetchCompletion { node, result })
            {
                // Nobody is processing completions any more.
                debug!(node_id = %completion.node.id, "Dropping fetch completion");
                activity.leave();
            }
        });

        FetchTicket::Issued
    }

    /// Free the in-flight slot of a node once its completion was processed.
    ///
    /// Returns whether a newer version was requested meanwhile.
    pub fn release(&self, node_id: &NodeId) -> bool {
        match self.in_flight().remove(node_id) {
            Some(entry) => {
                self.activity.leave();
                entry.follow_up
            }
            None => false,
        }
    }

    /// Hold the scheduler non-idle until the guard is dropped.
    pub fn activity_guard(&self) -> ActivityGuard {
        self.activity.enter();
        ActivityGuard {
            activity: self.activity.clone(),
        }
    }

    /// Check if a fetch for a node is in flight.
    pub fn is_in_flight(&self, node_id: &NodeId) -> bool {
        self.in_flight().contains_key(node_id)
    }

    /// Number of nodes with a fetch in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight().len()
    }

    /// Total fetches issued since creation.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Wait until no fetch is in flight and no completion is being processed.
    pub async fn wait_idle(&self) {
        let mut rx = self.activity.0.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop starting new fetches. Queued ones complete with `Shutdown`.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Get the download service.
    pub fn service(&self) -> &Arc<dyn DownloadService> {
        &self.service
    }
}
