//! Groups of search nodes
//!
//! A group holds one complete copy of the corpus, spread over its nodes.
//! The node list never changes; a topology change builds new groups.
//!
//! Derived statistics are written only by [`Group::aggregate_node_values`]
//! and the coordinator's coverage step, which run on a single logical writer.
//! Readers see each field independently and may observe a mix of two
//! consecutive aggregations.

use crate::node::{Liveness, Node};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Maximum summed deviation from the mean, relative to the total, for a
/// group to count as balanced
pub const MAX_CONTENT_SKEW: f64 = 0.10;

/// Below this many documents per node a group is too sparse to expect balance
pub const MIN_DOCS_PER_NODE_TO_REQUIRE_LOW_SKEW: u64 = 100;

/// An immutable set of nodes forming one corpus copy
#[derive(Debug)]
pub struct Group {
    id: u32,
    nodes: Vec<Arc<Node>>,

    has_sufficient_coverage: AtomicBool,
    has_full_coverage: AtomicBool,
    active_documents: AtomicU64,
    target_active_documents: AtomicU64,
    is_blocking_writes: AtomicBool,
    is_balanced: AtomicBool,
}

impl Group {
    /// Create a group, assigning each node its index within the group
    pub fn new(id: u32, nodes: Vec<Arc<Node>>) -> Self {
        for (index, node) in nodes.iter().enumerate() {
            node.set_path_index(index);
        }
        Self {
            id,
            nodes,
            has_sufficient_coverage: AtomicBool::new(true),
            has_full_coverage: AtomicBool::new(true),
            active_documents: AtomicU64::new(0),
            target_active_documents: AtomicU64::new(0),
            is_blocking_writes: AtomicBool::new(false),
            is_balanced: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Number of nodes not known to have failed
    pub fn working_nodes(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.is_working() != Liveness::Failed)
            .count()
    }

    /// Recompute document totals, write blocking and balance from the nodes.
    ///
    /// Must not run concurrently with itself.
    pub fn aggregate_node_values(&self) {
        let working: Vec<&Arc<Node>> = self
            .nodes
            .iter()
            .filter(|n| n.is_working() == Liveness::Working)
            .collect();

        let active: u64 = working.iter().map(|n| n.active_documents()).sum();
        let target: u64 = working.iter().map(|n| n.target_active_documents()).sum();
        self.active_documents.store(active, Ordering::Release);
        self.target_active_documents.store(target, Ordering::Release);
        self.is_blocking_writes.store(
            self.nodes.iter().any(|n| n.is_blocking_writes()),
            Ordering::Release,
        );

        if working.is_empty() {
            self.is_balanced.store(true, Ordering::Release);
            return;
        }

        let average = active / working.len() as u64;
        let skew: u64 = working
            .iter()
            .map(|n| n.active_documents().abs_diff(average))
            .sum();
        let balanced = skew as f64 <= active as f64 * MAX_CONTENT_SKEW;

        if balanced != self.is_balanced.load(Ordering::Acquire) {
            if !self.is_sparse() {
                info!(
                    "Content in {}, with {}/{} working nodes, is {}well balanced. \
                     Current deviation: {} %. Active documents: {}, skew: {}, average: {}{}",
                    self,
                    working.len(),
                    self.nodes.len(),
                    if balanced { "" } else { "not " },
                    skew * 100 / active.max(1),
                    active,
                    skew,
                    average,
                    if balanced {
                        ""
                    } else {
                        ". Top-k summary fetch optimization is deactivated."
                    }
                );
            }
            self.is_balanced.store(balanced, Ordering::Release);
        }
    }

    /// Sum of active documents over working nodes at the last aggregation
    pub fn active_documents(&self) -> u64 {
        self.active_documents.load(Ordering::Acquire)
    }

    pub fn target_active_documents(&self) -> u64 {
        self.target_active_documents.load(Ordering::Acquire)
    }

    /// Whether this group may receive queries, as decided by the coordinator
    pub fn has_sufficient_coverage(&self) -> bool {
        self.has_sufficient_coverage.load(Ordering::Acquire)
    }

    pub fn set_has_sufficient_coverage(&self, sufficient: bool) {
        self.has_sufficient_coverage.store(sufficient, Ordering::Release);
    }

    pub fn has_full_coverage(&self) -> bool {
        self.has_full_coverage.load(Ordering::Acquire)
    }

    /// Store the new full coverage state and report whether it changed
    pub fn full_coverage_status_changed(&self, has_full_coverage: bool) -> bool {
        self.has_full_coverage.swap(has_full_coverage, Ordering::AcqRel) != has_full_coverage
    }

    pub fn is_blocking_writes(&self) -> bool {
        self.is_blocking_writes.load(Ordering::Acquire)
    }

    /// Whether content is evenly spread over the working nodes
    pub fn is_balanced(&self) -> bool {
        self.is_balanced.load(Ordering::Acquire)
    }

    /// Whether the group holds too few documents per node to expect balance
    pub fn is_sparse(&self) -> bool {
        if self.nodes.is_empty() {
            return false;
        }
        self.active_documents() / (self.nodes.len() as u64) < MIN_DOCS_PER_NODE_TO_REQUIRE_LOW_SKEW
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group {}", self.id)
    }
}
