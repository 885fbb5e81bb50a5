//! Prism Dispatch - Search node health and dispatch target selection
//!
//! This crate keeps track of the search nodes behind a Prism query frontend
//! and decides where queries may go.
//!
//! # Architecture
//!
//! - **Node**: Lock-free liveness and document statistics of one search node
//! - **Group**: Immutable set of nodes holding one copy of the corpus, with
//!   aggregated coverage and balance
//! - **SearchGroups**: Immutable topology snapshot plus the coverage policy
//! - **SearchCluster**: Coordinator publishing snapshots, computing coverage,
//!   voting on rotation and choosing the local dispatch target
//! - **Ping/Pong**: Health probes correlated by per-node sequence ids
//! - **ClusterMonitor**: Periodic ping scheduling and liveness change detection
//!
//! # Data flow
//!
//! ```text
//! ClusterMonitor → ping → Pinger → Pong → PongHandler → Node atomics
//!        ↓
//! ping_iteration_completed → Group aggregates → coverage → rotation
//!        ↓
//! query path: groups_with_sufficient_coverage / local_corpus_dispatch_target
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod group;
pub mod groups;
pub mod metrics;
pub mod monitor;
pub mod node;
pub mod ping;
pub mod rotation;

pub use cluster::{DispatchSummary, GroupSummary, NodeSummary, SearchCluster};
pub use config::{DispatchConfig, GroupConfig, NodeConfig};
pub use error::{DispatchError, Result};
pub use group::Group;
pub use groups::SearchGroups;
pub use monitor::{ClusterMonitor, NodeManager, TrackedNode};
pub use node::{Liveness, Node};
pub use ping::{Pinger, Pong, PongHandler};
pub use rotation::{RotationSink, VipStatus};
