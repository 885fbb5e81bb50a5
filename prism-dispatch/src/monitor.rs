//! Node monitoring and ping scheduling
//!
//! The [`ClusterMonitor`] tracks the liveness it has last seen for each node
//! and tells its [`NodeManager`] only about changes:
//!
//! ```text
//! Tracked state: Unknown → Working ⇄ Failed
//!
//! Transitions:
//!   unknown → working/failed: first pong (always reported)
//!   working → failed: error pong or probe timeout
//!   failed → working: successful pong
//! ```
//!
//! Each ping iteration fires one probe per tracked node through the manager
//! and then calls [`NodeManager::ping_iteration_completed`]. Probes are
//! fire-and-forget, so aggregates computed at the end of an iteration reflect
//! pongs that have arrived so far. Retry and backoff are not done here; a
//! failed node is simply probed again on the next iteration.

use crate::node::{Liveness, Node};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The object managed by a [`ClusterMonitor`]
pub trait NodeManager: Send + Sync {
    /// Called when a node goes from unknown or failed to working
    fn working(&self, node: &Arc<Node>);

    /// Called when a node goes from unknown or working to failed
    fn failed(&self, node: &Arc<Node>);

    /// Called after one probe has been issued to every node
    fn ping_iteration_completed(&self);

    /// Issue one probe to `node`, reporting the pong to `monitor`
    fn ping(&self, monitor: Arc<ClusterMonitor>, node: Arc<Node>);
}

/// Monitor-side view of a node
#[derive(Debug, Clone)]
pub struct TrackedNode {
    pub node: Arc<Node>,
    pub liveness: Liveness,
    /// Last successful pong
    pub last_response: Option<Instant>,
    /// Error of the last failed probe
    pub last_error: Option<String>,
}

impl TrackedNode {
    fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            liveness: Liveness::Unknown,
            last_response: None,
            last_error: None,
        }
    }
}

/// Pings a set of nodes periodically and reports liveness changes
pub struct ClusterMonitor {
    node_manager: Arc<dyn NodeManager>,
    ping_interval: Duration,
    nodes: Mutex<Vec<TrackedNode>>,
    closed: AtomicBool,
}

impl ClusterMonitor {
    /// Create a monitor for `node_manager`
    pub fn new(node_manager: Arc<dyn NodeManager>, ping_interval: Duration) -> Self {
        Self {
            node_manager,
            ping_interval,
            nodes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Start tracking `node`; nodes already tracked are left as they are
    pub fn add(&self, node: Arc<Node>) {
        let mut nodes = self.nodes.lock();
        if !nodes.iter().any(|t| Arc::ptr_eq(&t.node, &node)) {
            debug!("Monitoring {}", node);
            nodes.push(TrackedNode::new(node));
        }
    }

    /// Stop tracking every node not in `keep`
    pub fn retain_only(&self, keep: &[Arc<Node>]) {
        self.nodes.lock().retain(|t| {
            let kept = keep.iter().any(|n| Arc::ptr_eq(n, &t.node));
            if !kept {
                info!("No longer monitoring {}", t.node);
            }
            kept
        });
    }

    /// Tracked state of all nodes
    pub fn tracked_nodes(&self) -> Vec<TrackedNode> {
        self.nodes.lock().clone()
    }

    /// Record a successful pong from `node`.
    ///
    /// The manager is called under the monitor lock so that changes for one
    /// node are delivered in the order they were observed.
    pub fn responded(&self, node: &Arc<Node>) {
        let mut nodes = self.nodes.lock();
        let Some(tracked) = nodes.iter_mut().find(|t| Arc::ptr_eq(&t.node, node)) else {
            debug!("Ignoring pong from untracked {}", node);
            return;
        };

        let previous = tracked.liveness;
        tracked.liveness = Liveness::Working;
        tracked.last_response = Some(Instant::now());
        tracked.last_error = None;

        if previous != Liveness::Working {
            if previous == Liveness::Failed {
                info!("{} is working again", node);
            }
            self.node_manager.working(node);
        }
    }

    /// Record a failed probe of `node`
    pub fn failed(&self, node: &Arc<Node>, error: &str) {
        let mut nodes = self.nodes.lock();
        let Some(tracked) = nodes.iter_mut().find(|t| Arc::ptr_eq(&t.node, node)) else {
            debug!("Ignoring failure of untracked {}", node);
            return;
        };

        let previous = tracked.liveness;
        tracked.liveness = Liveness::Failed;
        tracked.last_error = Some(error.to_string());

        if previous != Liveness::Failed {
            warn!("{} failed: {}", node, error);
            self.node_manager.failed(node);
        }
    }

    /// Run one ping iteration
    pub fn ping(self: &Arc<Self>) {
        let nodes: Vec<Arc<Node>> = self
            .nodes
            .lock()
            .iter()
            .map(|t| Arc::clone(&t.node))
            .collect();

        for node in nodes {
            if self.is_closed() {
                return;
            }
            self.node_manager.ping(Arc::clone(self), node);
        }

        if self.is_closed() {
            return;
        }
        self.node_manager.ping_iteration_completed();
    }

    /// Start the background ping loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.run_loop().await;
        })
    }

    /// Stop pinging; the background loop exits at its next tick
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn run_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.ping_interval);
        info!(
            "Cluster monitor started with {}ms ping interval",
            self.ping_interval.as_millis()
        );

        while !self.is_closed() {
            ticker.tick().await;
            if self.is_closed() {
                break;
            }
            self.ping();
        }

        info!("Cluster monitor stopped");
    }
}
