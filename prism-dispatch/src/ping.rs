//! Ping/pong health probes
//!
//! A ping is issued through a [`Pinger`] with a per-node sequence id. The
//! resulting [`Pong`] is applied by a [`PongHandler`] only if no newer pong
//! has been accepted for that node, so out-of-order delivery never lets stale
//! statistics overwrite fresh ones.
//!
//! Transport, serialization and probe timeouts live behind the [`Pinger`]
//! implementation.

use crate::metrics;
use crate::monitor::ClusterMonitor;
use crate::node::Node;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Result of one health probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Active documents reported by the node, if it reported statistics
    pub active_documents: Option<u64>,
    /// Documents the node should have active once fully synced
    pub target_active_documents: Option<u64>,
    /// Whether the node currently rejects feed because of resource limits
    pub blocking_writes: bool,
    /// Set when the probe failed or the node answered with an error
    pub error: Option<String>,
}

impl Pong {
    /// A successful pong without document statistics
    pub fn ok() -> Self {
        Self::default()
    }

    /// A successful pong with document statistics
    pub fn with_documents(active: u64, target: u64, blocking_writes: bool) -> Self {
        Self {
            active_documents: Some(active),
            target_active_documents: Some(target),
            blocking_writes,
            error: None,
        }
    }

    /// A failed probe
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn bad_response(&self) -> bool {
        self.error.is_some()
    }
}

/// Issues health probes to search nodes
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Probe `node`. Errors and timeouts are reported as a failed [`Pong`].
    async fn ping(&self, node: &Node, ping_id: u64) -> Pong;
}

/// Applies one pong to its node and reports the outcome to the monitor
pub struct PongHandler {
    node: Arc<Node>,
    ping_id: u64,
    monitor: Arc<ClusterMonitor>,
}

impl PongHandler {
    pub fn new(node: Arc<Node>, ping_id: u64, monitor: Arc<ClusterMonitor>) -> Self {
        Self {
            node,
            ping_id,
            monitor,
        }
    }

    /// Apply `pong`. Returns false when it was stale and discarded.
    pub fn handle(self, pong: Pong) -> bool {
        if !self.node.is_last_received_pong(self.ping_id) {
            debug!("Discarding stale pong {} from {}", self.ping_id, self.node);
            metrics::record_pong("stale");
            return false;
        }

        match pong.error {
            Some(error) => {
                metrics::record_pong("error");
                self.monitor.failed(&self.node, &error);
            }
            None => {
                metrics::record_pong("ok");
                if let Some(active) = pong.active_documents {
                    self.node.set_active_documents(active);
                    let target = pong.target_active_documents.unwrap_or(active);
                    self.node.set_target_active_documents(target);
                    self.node.set_blocking_writes(pong.blocking_writes);
                }
                self.monitor.responded(&self.node);
            }
        }
        true
    }
}

/// Ping `node` on the current tokio runtime without waiting for the answer
pub fn spawn_ping(
    pinger: Arc<dyn Pinger>,
    monitor: Arc<ClusterMonitor>,
    node: Arc<Node>,
) -> JoinHandle<()> {
    let ping_id = node.create_ping_sequence_id();
    tokio::spawn(async move {
        let pong = pinger.ping(&node, ping_id).await;
        PongHandler::new(node, ping_id, monitor).handle(pong);
    })
}
