//! Per-node liveness and document statistics
//!
//! A [`Node`] is shared between the ping handlers that write it and the
//! dispatch path that reads it. Every mutable field is its own atomic cell;
//! no cross-field atomicity is assumed by any reader.
//!
//! ```text
//! Liveness: Unknown → Working ⇄ Failed
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Liveness of a node as last reported by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// No health result has been received yet
    Unknown,
    /// Node answered its last ping
    Working,
    /// Node failed its last ping or reported an error
    Failed,
}

impl Liveness {
    /// Get liveness as a string for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Unknown => "unknown",
            Liveness::Working => "working",
            Liveness::Failed => "failed",
        }
    }

    /// Whether a health result has been received
    pub fn is_known(&self) -> bool {
        !matches!(self, Liveness::Unknown)
    }
}

/// A search node serving one part of a group's corpus
#[derive(Debug)]
pub struct Node {
    key: u32,
    hostname: String,
    group: u32,
    path_index: AtomicUsize,

    status_is_known: AtomicBool,
    working: AtomicBool,
    active_documents: AtomicU64,
    target_active_documents: AtomicU64,
    ping_sequence: AtomicU64,
    last_pong: AtomicU64,
    blocking_writes: AtomicBool,
}

impl Node {
    /// Create a node with unknown liveness
    pub fn new(key: u32, hostname: impl Into<String>, group: u32) -> Self {
        Self {
            key,
            hostname: hostname.into(),
            group,
            path_index: AtomicUsize::new(0),
            status_is_known: AtomicBool::new(false),
            working: AtomicBool::new(true),
            active_documents: AtomicU64::new(0),
            target_active_documents: AtomicU64::new(0),
            ping_sequence: AtomicU64::new(0),
            last_pong: AtomicU64::new(0),
            blocking_writes: AtomicBool::new(false),
        }
    }

    /// Distribution key of this node
    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Id of the group this node belongs to
    pub fn group(&self) -> u32 {
        self.group
    }

    /// Index of this node among the nodes of its group
    pub fn path_index(&self) -> usize {
        self.path_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_path_index(&self, index: usize) {
        self.path_index.store(index, Ordering::Relaxed);
    }

    /// Whether `other` describes the same configured node
    pub fn same_identity(&self, other: &Node) -> bool {
        self.key == other.key && self.group == other.group && self.hostname == other.hostname
    }

    /// Allocate the id of the next outbound ping
    pub fn create_ping_sequence_id(&self) -> u64 {
        self.ping_sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Accept `ping_id` if it is newer than every pong accepted so far.
    ///
    /// Returns false for stale or duplicate pongs; their payload must be
    /// discarded by the caller.
    pub fn is_last_received_pong(&self, ping_id: u64) -> bool {
        let mut last = self.last_pong.load(Ordering::Acquire);
        while ping_id > last {
            match self.last_pong.compare_exchange_weak(
                last,
                ping_id,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => last = current,
            }
        }
        false
    }

    /// Current liveness of this node
    pub fn is_working(&self) -> Liveness {
        if !self.status_is_known.load(Ordering::Acquire) {
            Liveness::Unknown
        } else if self.working.load(Ordering::Acquire) {
            Liveness::Working
        } else {
            Liveness::Failed
        }
    }

    /// Record a liveness result. A failed node loses its document counts.
    pub fn set_working(&self, working: bool) {
        self.working.store(working, Ordering::Release);
        self.status_is_known.store(true, Ordering::Release);
        if !working {
            self.active_documents.store(0, Ordering::Release);
            self.target_active_documents.store(0, Ordering::Release);
        }
    }

    pub fn active_documents(&self) -> u64 {
        self.active_documents.load(Ordering::Acquire)
    }

    pub fn set_active_documents(&self, documents: u64) {
        self.active_documents.store(documents, Ordering::Release);
    }

    pub fn target_active_documents(&self) -> u64 {
        self.target_active_documents.load(Ordering::Acquire)
    }

    pub fn set_target_active_documents(&self, documents: u64) {
        self.target_active_documents.store(documents, Ordering::Release);
    }

    pub fn is_blocking_writes(&self) -> bool {
        self.blocking_writes.load(Ordering::Acquire)
    }

    pub fn set_blocking_writes(&self, blocking: bool) {
        self.blocking_writes.store(blocking, Ordering::Release);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "search node key = {} hostname = {} path = {} in group {}",
            self.key,
            self.hostname,
            self.path_index(),
            self.group
        )
    }
}
