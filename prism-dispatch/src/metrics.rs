//! Dispatch observability metrics
//!
//! Records through the `metrics` facade; installing an exporter is up to the
//! embedding server. Covers:
//! - Pong outcomes (ok/error/stale)
//! - Node liveness
//! - Group documents, coverage and balance
//! - Rotation votes
//! - Topology updates and rejections

use crate::error::DispatchError;
use crate::group::Group;
use crate::node::Node;
use std::time::Duration;

/// Record the outcome of one pong
pub fn record_pong(outcome: &str) {
    metrics::counter!(
        "prism_dispatch_pongs_total",
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

/// Record a node liveness change
pub fn record_node_liveness(cluster_id: &str, node: &Node, working: bool) {
    metrics::gauge!(
        "prism_dispatch_node_working",
        "cluster" => cluster_id.to_string(),
        "node" => node.key().to_string(),
        "group" => node.group().to_string(),
    )
    .set(if working { 1.0 } else { 0.0 });
}

/// Record the aggregated state of a group after a ping iteration
pub fn update_group_metrics(cluster_id: &str, group: &Group) {
    let group_id = group.id().to_string();

    metrics::gauge!(
        "prism_dispatch_group_active_documents",
        "cluster" => cluster_id.to_string(),
        "group" => group_id.clone(),
    )
    .set(group.active_documents() as f64);

    metrics::gauge!(
        "prism_dispatch_group_target_active_documents",
        "cluster" => cluster_id.to_string(),
        "group" => group_id.clone(),
    )
    .set(group.target_active_documents() as f64);

    metrics::gauge!(
        "prism_dispatch_group_sufficient_coverage",
        "cluster" => cluster_id.to_string(),
        "group" => group_id.clone(),
    )
    .set(if group.has_sufficient_coverage() { 1.0 } else { 0.0 });

    metrics::gauge!(
        "prism_dispatch_group_balanced",
        "cluster" => cluster_id.to_string(),
        "group" => group_id.clone(),
    )
    .set(if group.is_balanced() { 1.0 } else { 0.0 });

    metrics::gauge!(
        "prism_dispatch_group_working_nodes",
        "cluster" => cluster_id.to_string(),
        "group" => group_id,
    )
    .set(group.working_nodes() as f64);
}

/// Record a rotation vote of a cluster
pub fn record_rotation(cluster_id: &str, in_rotation: bool) {
    metrics::gauge!(
        "prism_dispatch_in_rotation",
        "cluster" => cluster_id.to_string(),
    )
    .set(if in_rotation { 1.0 } else { 0.0 });
}

/// Record a published topology update
pub fn record_topology_update(
    cluster_id: &str,
    node_count: usize,
    added: usize,
    duration: Duration,
) {
    metrics::counter!(
        "prism_dispatch_topology_updates_total",
        "cluster" => cluster_id.to_string(),
    )
    .increment(1);

    metrics::counter!(
        "prism_dispatch_nodes_added_total",
        "cluster" => cluster_id.to_string(),
    )
    .increment(added as u64);

    metrics::gauge!(
        "prism_dispatch_nodes",
        "cluster" => cluster_id.to_string(),
    )
    .set(node_count as f64);

    metrics::histogram!(
        "prism_dispatch_topology_update_duration_seconds",
        "cluster" => cluster_id.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record a rejected topology update
pub fn record_topology_update_failure(cluster_id: &str, error: &DispatchError) {
    metrics::counter!(
        "prism_dispatch_topology_update_errors_total",
        "cluster" => cluster_id.to_string(),
        "error_type" => error.error_type(),
    )
    .increment(1);
}
