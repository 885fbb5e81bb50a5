//! Search cluster coordinator
//!
//! [`SearchCluster`] owns the published topology of one search cluster and
//! turns node liveness and document counts into dispatch decisions:
//!
//! - which groups have sufficient coverage to receive queries
//! - whether this frontend should be in load balancer rotation
//! - whether queries can go straight to a single co-located node
//!
//! # Concurrency
//!
//! The topology (groups plus the local dispatch target) is an immutable value
//! behind an [`ArcSwap`]. Readers load it once per operation and never block.
//! Ping iteration completion is the only writer of group statistics and is
//! serialized by a mutex, so it never runs concurrently with itself.
//!
//! # Example
//!
//! ```ignore
//! use prism_dispatch::{DispatchConfig, SearchCluster, VipStatus};
//!
//! let vip = Arc::new(VipStatus::default());
//! let (cluster, monitor) = SearchCluster::bootstrap(config, pinger, vip.clone()).await?;
//! monitor.start();
//!
//! match cluster.local_corpus_dispatch_target() {
//!     Some(node) => dispatch_to(node),
//!     None => fan_out(cluster.groups_with_sufficient_coverage()),
//! }
//! ```

use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::group::Group;
use crate::groups::SearchGroups;
use crate::metrics;
use crate::monitor::{ClusterMonitor, NodeManager};
use crate::node::{Liveness, Node};
use crate::ping::{self, Pinger};
use crate::rotation::RotationSink;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Topology published to readers as one unit
#[derive(Debug)]
struct Topology {
    groups: Arc<SearchGroups>,
    local_corpus_dispatch_target: Option<Arc<Node>>,
}

impl Topology {
    fn uses_local_corpus_in(&self, node: &Arc<Node>) -> bool {
        self.local_corpus_dispatch_target
            .as_ref()
            .is_some_and(|target| Arc::ptr_eq(target, node))
    }

    fn uses_local_corpus_in_group(&self, group: &Group) -> bool {
        self.local_corpus_dispatch_target
            .as_ref()
            .is_some_and(|target| target.group() == group.id())
    }
}

/// State owned by the iteration-completion writer
#[derive(Debug)]
struct IterationState {
    next_log_time: Instant,
}

/// Serializable view of a cluster's dispatch state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub cluster_id: String,
    pub all_nodes_known: bool,
    /// Distribution key of the usable local dispatch target, if any
    pub local_corpus_dispatch_target: Option<u32>,
    pub groups: Vec<GroupSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub id: u32,
    pub active_documents: u64,
    pub target_active_documents: u64,
    pub sufficient_coverage: bool,
    pub full_coverage: bool,
    pub balanced: bool,
    pub blocking_writes: bool,
    pub working_nodes: usize,
    pub nodes: Vec<NodeSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub key: u32,
    pub hostname: String,
    pub liveness: Liveness,
    pub active_documents: u64,
}

/// Coordinator of node health, group coverage and dispatch decisions
pub struct SearchCluster {
    cluster_id: String,
    hostname: String,
    topology: ArcSwap<Topology>,
    pinger: Arc<dyn Pinger>,
    rotation: Arc<dyn RotationSink>,
    iteration: Mutex<IterationState>,
    liveness_tx: watch::Sender<u64>,
    update_lock: tokio::sync::Mutex<()>,
    topology_update_timeout: Duration,
    coverage_log_interval: Duration,
}

impl SearchCluster {
    /// Create a cluster with an empty topology
    pub fn new(
        config: &DispatchConfig,
        pinger: Arc<dyn Pinger>,
        rotation: Arc<dyn RotationSink>,
    ) -> Self {
        let (liveness_tx, _) = watch::channel(0u64);
        Self {
            cluster_id: config.cluster_id.clone(),
            hostname: config.hostname.clone(),
            topology: ArcSwap::from_pointee(Topology {
                groups: Arc::new(SearchGroups::empty(config.min_active_docs_percentage)),
                local_corpus_dispatch_target: None,
            }),
            pinger,
            rotation,
            iteration: Mutex::new(IterationState {
                next_log_time: Instant::now(),
            }),
            liveness_tx,
            update_lock: tokio::sync::Mutex::new(()),
            topology_update_timeout: config.topology_update_timeout(),
            coverage_log_interval: config.coverage_log_interval(),
        }
    }

    /// Create a cluster and its monitor, and publish the configured topology.
    ///
    /// The monitor's background loop is not started.
    pub async fn bootstrap(
        config: DispatchConfig,
        pinger: Arc<dyn Pinger>,
        rotation: Arc<dyn RotationSink>,
    ) -> Result<(Arc<Self>, Arc<ClusterMonitor>)> {
        config.validate()?;
        let cluster = Arc::new(Self::new(&config, pinger, rotation));
        let monitor = Arc::new(ClusterMonitor::new(
            Arc::clone(&cluster) as Arc<dyn NodeManager>,
            config.ping_interval(),
        ));
        cluster
            .update_nodes(config.nodes(), &monitor, config.min_active_docs_percentage)
            .await?;
        Ok((cluster, monitor))
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Hostname of this frontend
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    // ========================================
    // Topology updates
    // ========================================

    /// Replace the set of nodes in this cluster.
    ///
    /// Nodes with the same identity as a current node keep their node object
    /// and statistics. New nodes are pinged, and the update waits until each
    /// of them has a first liveness result or the topology update timeout
    /// passes; nodes still unknown after that are published as unknown.
    /// Dropping the returned future before it completes leaves the current
    /// topology in place.
    ///
    /// Concurrent calls run one at a time, in the order they started.
    pub async fn update_nodes(
        &self,
        nodes: Vec<Node>,
        monitor: &Arc<ClusterMonitor>,
        min_active_docs_percentage: f64,
    ) -> Result<()> {
        let _update = self.update_lock.lock().await;
        let started = Instant::now();
        validate_nodes(&nodes).inspect_err(|err| {
            warn!("Cluster {}: rejected topology update: {}", self.cluster_id, err);
            metrics::record_topology_update_failure(&self.cluster_id, err);
        })?;

        let current = self.topology.load_full();
        let existing: HashMap<u32, &Arc<Node>> =
            current.groups.nodes().map(|n| (n.key(), n)).collect();

        let mut added = Vec::new();
        let nodes: Vec<Arc<Node>> = nodes
            .into_iter()
            .map(|node| match existing.get(&node.key()) {
                Some(retained) if retained.same_identity(&node) => Arc::clone(retained),
                _ => {
                    let node = Arc::new(node);
                    added.push(Arc::clone(&node));
                    node
                }
            })
            .collect();

        let groups = SearchGroups::from_nodes(nodes, min_active_docs_percentage);
        let local_corpus_dispatch_target =
            find_local_corpus_dispatch_target(&self.hostname, &groups);
        if let Some(target) = &local_corpus_dispatch_target {
            info!(
                "Cluster {}: dispatching directly to local {}",
                self.cluster_id, target
            );
        }
        let topology = Arc::new(Topology {
            groups: Arc::new(groups),
            local_corpus_dispatch_target,
        });

        for node in topology.groups.nodes() {
            monitor.add(Arc::clone(node));
        }

        let mut liveness = self.liveness_tx.subscribe();
        monitor.ping();
        self.wait_for_first_liveness(&added, &mut liveness).await;

        {
            let mut state = self.iteration.lock();
            self.complete_iteration(&topology, &mut state);
        }
        self.topology.store(Arc::clone(&topology));
        self.refresh_rotation(&topology);

        let all_nodes: Vec<Arc<Node>> = topology.groups.nodes().cloned().collect();
        monitor.retain_only(&all_nodes);

        info!(
            "Cluster {}: published {} groups with {} nodes ({} new)",
            self.cluster_id,
            topology.groups.size(),
            all_nodes.len(),
            added.len()
        );
        metrics::record_topology_update(
            &self.cluster_id,
            all_nodes.len(),
            added.len(),
            started.elapsed(),
        );
        Ok(())
    }

    async fn wait_for_first_liveness(
        &self,
        added: &[Arc<Node>],
        liveness: &mut watch::Receiver<u64>,
    ) {
        let deadline = tokio::time::Instant::now() + self.topology_update_timeout;
        loop {
            let unknown = added.iter().filter(|n| !n.is_working().is_known()).count();
            if unknown == 0 {
                return;
            }
            match tokio::time::timeout_at(deadline, liveness.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return,
                Err(_) => {
                    warn!(
                        "Cluster {}: {} new nodes have not answered after {}ms, \
                         publishing them as unknown",
                        self.cluster_id,
                        unknown,
                        self.topology_update_timeout.as_millis()
                    );
                    return;
                }
            }
        }
    }

    fn notify_liveness_change(&self) {
        self.liveness_tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    // ========================================
    // Readers
    // ========================================

    /// The current topology snapshot
    pub fn groups(&self) -> Arc<SearchGroups> {
        Arc::clone(&self.topology.load().groups)
    }

    pub fn group(&self, id: u32) -> Option<Arc<Group>> {
        self.topology.load().groups.get(id).cloned()
    }

    /// All groups ordered by id
    pub fn group_list(&self) -> Vec<Arc<Group>> {
        self.topology.load().groups.groups().cloned().collect()
    }

    /// Number of nodes in the cluster
    pub fn size(&self) -> usize {
        self.topology.load().groups.nodes().count()
    }

    /// Groups that may currently receive queries
    pub fn groups_with_sufficient_coverage(&self) -> Vec<Arc<Group>> {
        self.topology
            .load()
            .groups
            .groups()
            .filter(|g| g.has_sufficient_coverage())
            .cloned()
            .collect()
    }

    /// Whether every node has a liveness result
    pub fn has_information_about_all_nodes(&self) -> bool {
        has_information_about_all_nodes(&self.topology.load().groups)
    }

    /// Whether querying only `nodes` of a group gives sufficient coverage
    pub fn is_partial_group_coverage_sufficient(&self, nodes: &[Arc<Node>]) -> bool {
        self.topology
            .load()
            .groups
            .is_partial_group_coverage_sufficient(nodes)
    }

    /// The co-located node holding a whole group's corpus, if it can be used now
    pub fn local_corpus_dispatch_target(&self) -> Option<Arc<Node>> {
        let topology = self.topology.load();
        let target = topology.local_corpus_dispatch_target.as_ref()?;

        let group = topology.groups.get(target.group())?;
        if !group.has_sufficient_coverage() {
            return None;
        }
        if target.is_working() == Liveness::Failed {
            return None;
        }
        Some(Arc::clone(target))
    }

    /// Snapshot of the dispatch state for status pages and logs
    pub fn dispatch_summary(&self) -> DispatchSummary {
        let groups = self.groups();
        DispatchSummary {
            cluster_id: self.cluster_id.clone(),
            all_nodes_known: has_information_about_all_nodes(&groups),
            local_corpus_dispatch_target: self.local_corpus_dispatch_target().map(|n| n.key()),
            groups: groups
                .groups()
                .map(|g| GroupSummary {
                    id: g.id(),
                    active_documents: g.active_documents(),
                    target_active_documents: g.target_active_documents(),
                    sufficient_coverage: g.has_sufficient_coverage(),
                    full_coverage: g.has_full_coverage(),
                    balanced: g.is_balanced(),
                    blocking_writes: g.is_blocking_writes(),
                    working_nodes: g.working_nodes(),
                    nodes: g
                        .nodes()
                        .iter()
                        .map(|n| NodeSummary {
                            key: n.key(),
                            hostname: n.hostname().to_string(),
                            liveness: n.is_working(),
                            active_documents: n.active_documents(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    // ========================================
    // Ping iteration completion
    // ========================================

    fn complete_iteration(&self, topology: &Topology, state: &mut IterationState) {
        let groups = &topology.groups;

        if groups.size() == 1 {
            if let Some(group) = groups.groups().next() {
                group.aggregate_node_values();
                // a lone group has no peer to fall short of
                self.update_sufficient_coverage(topology, group, true);
                let reference = group.active_documents();
                let full = groups.is_group_coverage_sufficient(group.active_documents(), reference);
                self.track_group_coverage_changes(groups, group, full, reference, state);
                metrics::update_group_metrics(&self.cluster_id, group);
            }
            return;
        }

        for group in groups.groups() {
            group.aggregate_node_values();
        }
        let median = groups.median_documents_per_group();
        for group in groups.groups() {
            let sufficient = groups.is_group_coverage_sufficient(group.active_documents(), median);
            self.update_sufficient_coverage(topology, group, sufficient);
            self.track_group_coverage_changes(groups, group, sufficient, median, state);
            metrics::update_group_metrics(&self.cluster_id, group);
        }
    }

    fn update_sufficient_coverage(&self, topology: &Topology, group: &Group, sufficient: bool) {
        if sufficient == group.has_sufficient_coverage() {
            return;
        }
        debug!(
            "Cluster {}: {} sufficient coverage is now {}",
            self.cluster_id, group, sufficient
        );
        group.set_has_sufficient_coverage(sufficient);
        if topology.uses_local_corpus_in_group(group) {
            self.set_in_rotation_only_if(sufficient);
        }
    }

    fn track_group_coverage_changes(
        &self,
        groups: &SearchGroups,
        group: &Group,
        full_coverage: bool,
        reference_documents: u64,
        state: &mut IterationState,
    ) {
        // stay quiet until every node has reported
        if !has_information_about_all_nodes(groups) {
            return;
        }

        let changed = group.full_coverage_status_changed(full_coverage);
        let now = Instant::now();
        if !changed && (full_coverage || now < state.next_log_time) {
            return;
        }
        state.next_log_time = now + self.coverage_log_interval;

        if full_coverage {
            info!(
                "Cluster {}: {} has full coverage. Active documents: {}/{}, working nodes: {}/{}",
                self.cluster_id,
                group,
                group.active_documents(),
                reference_documents,
                group.working_nodes(),
                group.nodes().len()
            );
            return;
        }

        let unresponsive: Vec<String> = group
            .nodes()
            .iter()
            .filter(|n| n.is_working() != Liveness::Working)
            .map(|n| n.to_string())
            .collect();
        let message = format!(
            "Cluster {}: {} has reduced coverage: Active documents: {}/{}, \
             Target active documents: {}, working nodes: {}/{}, unresponsive nodes: {}",
            self.cluster_id,
            group,
            group.active_documents(),
            reference_documents,
            group.target_active_documents(),
            group.working_nodes(),
            group.nodes().len(),
            if unresponsive.is_empty() {
                "none".to_string()
            } else {
                unresponsive.join(", ")
            }
        );
        if unresponsive.len() == 1 {
            info!("{}", message);
        } else {
            warn!("{}", message);
        }
    }

    // ========================================
    // Rotation
    // ========================================

    fn update_vip_status_on_node_change(&self, node: &Arc<Node>, node_is_working: bool) {
        let topology = self.topology.load();
        if topology.groups.is_empty() {
            return;
        }

        if topology.local_corpus_dispatch_target.is_none() {
            if has_information_about_all_nodes(&topology.groups) {
                self.set_in_rotation_only_if(has_working_nodes(&topology.groups));
            }
        } else if topology.uses_local_corpus_in(node) {
            // Taking a single node cluster out of rotation would stop the
            // traffic that is needed to bring it back
            if node_is_working || topology.groups.nodes().count() > 1 {
                self.set_in_rotation_only_if(node_is_working);
            }
        }
    }

    /// Vote on rotation from scratch for a newly published topology
    fn refresh_rotation(&self, topology: &Topology) {
        if topology.groups.is_empty() {
            return;
        }

        match &topology.local_corpus_dispatch_target {
            None => {
                if has_information_about_all_nodes(&topology.groups) {
                    self.set_in_rotation_only_if(has_working_nodes(&topology.groups));
                }
            }
            Some(target) => {
                let liveness = target.is_working();
                if !liveness.is_known() {
                    return;
                }
                if liveness == Liveness::Failed && topology.groups.nodes().count() == 1 {
                    return;
                }
                let sufficient = topology
                    .groups
                    .get(target.group())
                    .is_some_and(|g| g.has_sufficient_coverage());
                self.set_in_rotation_only_if(liveness == Liveness::Working && sufficient);
            }
        }
    }

    fn set_in_rotation_only_if(&self, in_rotation: bool) {
        if in_rotation {
            self.rotation.add_to_rotation(&self.cluster_id);
        } else {
            self.rotation.remove_from_rotation(&self.cluster_id);
        }
    }
}

impl NodeManager for SearchCluster {
    fn working(&self, node: &Arc<Node>) {
        node.set_working(true);
        metrics::record_node_liveness(&self.cluster_id, node, true);
        self.update_vip_status_on_node_change(node, true);
        self.notify_liveness_change();
    }

    fn failed(&self, node: &Arc<Node>) {
        node.set_working(false);
        metrics::record_node_liveness(&self.cluster_id, node, false);
        self.update_vip_status_on_node_change(node, false);
        self.notify_liveness_change();
    }

    fn ping_iteration_completed(&self) {
        let topology = self.topology.load_full();
        let mut state = self.iteration.lock();
        self.complete_iteration(&topology, &mut state);
    }

    fn ping(&self, monitor: Arc<ClusterMonitor>, node: Arc<Node>) {
        ping::spawn_ping(Arc::clone(&self.pinger), monitor, node);
    }
}

/// Reject duplicate keys and gaps in group ids before any node is touched
fn validate_nodes(nodes: &[Node]) -> Result<()> {
    let mut keys = HashSet::new();
    for node in nodes {
        if !keys.insert(node.key()) {
            return Err(DispatchError::InvalidTopology(format!(
                "distribution key {} is used by more than one node",
                node.key()
            )));
        }
    }

    let group_ids: BTreeSet<u32> = nodes.iter().map(|n| n.group()).collect();
    if let Some((position, id)) = group_ids
        .iter()
        .enumerate()
        .find(|(position, id)| **id != *position as u32)
    {
        return Err(DispatchError::InvalidTopology(format!(
            "group ids must be contiguous from 0, found group {} at position {}",
            id, position
        )));
    }
    Ok(())
}

fn has_information_about_all_nodes(groups: &SearchGroups) -> bool {
    groups.nodes().all(|n| n.is_working().is_known())
}

fn has_working_nodes(groups: &SearchGroups) -> bool {
    groups.nodes().any(|n| n.is_working() != Liveness::Failed)
}

/// A node on this host qualifies only if it is the only one here and alone
/// in its group, so it holds the entire corpus
fn find_local_corpus_dispatch_target(hostname: &str, groups: &SearchGroups) -> Option<Arc<Node>> {
    let mut local = groups.nodes().filter(|n| n.hostname() == hostname);
    let target = local.next()?;
    if local.next().is_some() {
        return None;
    }

    let group = groups.get(target.group())?;
    if group.nodes().len() != 1 {
        return None;
    }
    Some(Arc::clone(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ping::Pong;
    use crate::rotation::VipStatus;
    use async_trait::async_trait;
    use tracing_subscriber::fmt::MakeWriter;

    const LOCAL: &str = "local.example.com";

    /// Answers every ping with the documents configured for the node key
    struct DocsPinger {
        docs: Mutex<HashMap<u32, u64>>,
    }

    #[async_trait]
    impl Pinger for DocsPinger {
        async fn ping(&self, node: &Node, _ping_id: u64) -> Pong {
            let docs = self.docs.lock().get(&node.key()).copied();
            match docs {
                Some(d) => Pong::with_documents(d, d, false),
                None => Pong::failed("no such node"),
            }
        }
    }

    /// Never answers
    struct SilentPinger;

    #[async_trait]
    impl Pinger for SilentPinger {
        async fn ping(&self, _node: &Node, _ping_id: u64) -> Pong {
            std::future::pending().await
        }
    }

    /// Answers with 100 documents after a per-node delay
    struct DelayedPinger {
        delays: HashMap<u32, Duration>,
    }

    #[async_trait]
    impl Pinger for DelayedPinger {
        async fn ping(&self, node: &Node, _ping_id: u64) -> Pong {
            if let Some(delay) = self.delays.get(&node.key()) {
                tokio::time::sleep(*delay).await;
            }
            Pong::with_documents(100, 100, false)
        }
    }

    /// Log lines written while a closure runs under a scoped subscriber
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn during(&self, f: impl FnOnce()) {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(self.clone())
                .with_ansi(false)
                .with_max_level(tracing::Level::INFO)
                .finish();
            tracing::subscriber::with_default(subscriber, f);
        }

        fn lines(&self, needle: &str) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .filter(|line| line.contains(needle))
                .map(str::to_string)
                .collect()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    struct Fixture {
        cluster: Arc<SearchCluster>,
        monitor: Arc<ClusterMonitor>,
        vip: Arc<VipStatus>,
    }

    fn config(min_pct: f64) -> DispatchConfig {
        DispatchConfig {
            cluster_id: "test".to_string(),
            hostname: LOCAL.to_string(),
            min_active_docs_percentage: min_pct,
            topology_update_timeout_ms: 200,
            ..DispatchConfig::default()
        }
    }

    /// `layout[g]` lists (hostname, docs) of the nodes in group g
    async fn fixture(layout: &[&[(&str, u64)]], min_pct: f64) -> Fixture {
        let mut nodes = Vec::new();
        let mut docs = HashMap::new();
        let mut key = 0;
        for (group, members) in layout.iter().enumerate() {
            for (host, d) in members.iter() {
                nodes.push(Node::new(key, *host, group as u32));
                docs.insert(key, *d);
                key += 1;
            }
        }

        let vip = Arc::new(VipStatus::default());
        let pinger = Arc::new(DocsPinger {
            docs: Mutex::new(docs),
        });
        let cluster = Arc::new(SearchCluster::new(&config(min_pct), pinger, vip.clone()));
        let monitor = Arc::new(ClusterMonitor::new(
            Arc::clone(&cluster) as Arc<dyn NodeManager>,
            Duration::from_secs(60),
        ));
        cluster.update_nodes(nodes, &monitor, min_pct).await.unwrap();
        Fixture {
            cluster,
            monitor,
            vip,
        }
    }

    fn silent_cluster(vip: Arc<VipStatus>) -> (Arc<SearchCluster>, Arc<ClusterMonitor>) {
        let cluster = Arc::new(SearchCluster::new(&config(97.0), Arc::new(SilentPinger), vip));
        let monitor = Arc::new(ClusterMonitor::new(
            Arc::clone(&cluster) as Arc<dyn NodeManager>,
            Duration::from_secs(60),
        ));
        (cluster, monitor)
    }

    fn tracked_keys(monitor: &ClusterMonitor) -> Vec<u32> {
        let mut keys: Vec<u32> = monitor.tracked_nodes().iter().map(|t| t.node.key()).collect();
        keys.sort_unstable();
        keys
    }

    fn node(cluster: &SearchCluster, key: u32) -> Arc<Node> {
        cluster.groups().nodes().find(|n| n.key() == key).cloned().unwrap()
    }

    #[tokio::test]
    async fn test_update_nodes_waits_for_first_pong() {
        let f = fixture(&[&[("a", 100)], &[("b", 100)]], 97.0).await;
        assert!(f.cluster.has_information_about_all_nodes());
        assert_eq!(f.cluster.size(), 2);
        assert_eq!(f.cluster.group(0).unwrap().active_documents(), 100);
        assert_eq!(f.vip.cluster_status("test"), Some(true));
    }

    #[tokio::test]
    async fn test_multi_group_coverage() {
        let f = fixture(&[&[("a", 100)], &[("b", 100)], &[("c", 10)]], 50.0).await;
        let sufficient: Vec<u32> = f
            .cluster
            .groups_with_sufficient_coverage()
            .iter()
            .map(|g| g.id())
            .collect();
        assert_eq!(sufficient, vec![0, 1]);
        assert!(!f.cluster.group(2).unwrap().has_sufficient_coverage());
    }

    #[tokio::test]
    async fn test_coverage_recovers_after_iteration() {
        let f = fixture(&[&[("a", 100)], &[("b", 100)], &[("c", 10)]], 50.0).await;
        node(&f.cluster, 2).set_active_documents(95);
        f.cluster.ping_iteration_completed();
        assert_eq!(f.cluster.groups_with_sufficient_coverage().len(), 3);
    }

    #[tokio::test]
    async fn test_single_group_always_sufficient() {
        let f = fixture(&[&[("a", 1000), ("b", 1)]], 99.0).await;
        let group = f.cluster.group(0).unwrap();
        assert!(group.has_sufficient_coverage());
        assert!(f.cluster.groups().is_group_coverage_sufficient(0, 1_000_000));

        f.cluster.failed(&node(&f.cluster, 0));
        f.cluster.ping_iteration_completed();
        assert!(group.has_sufficient_coverage());
        assert_eq!(group.active_documents(), 1);
    }

    #[tokio::test]
    async fn test_local_dispatch_target_alone_in_group() {
        let f = fixture(&[&[(LOCAL, 100)], &[("b", 100)]], 97.0).await;
        let target = f.cluster.local_corpus_dispatch_target().unwrap();
        assert_eq!(target.key(), 0);
        assert_eq!(f.cluster.dispatch_summary().local_corpus_dispatch_target, Some(0));
    }

    #[tokio::test]
    async fn test_no_local_target_when_group_has_two_nodes() {
        let f = fixture(&[&[(LOCAL, 100), ("b", 100)]], 97.0).await;
        assert!(f.cluster.local_corpus_dispatch_target().is_none());
    }

    #[tokio::test]
    async fn test_no_local_target_when_two_local_nodes() {
        let f = fixture(&[&[(LOCAL, 100)], &[(LOCAL, 100)]], 97.0).await;
        assert!(f.cluster.local_corpus_dispatch_target().is_none());
    }

    #[tokio::test]
    async fn test_local_target_gated_on_coverage_and_liveness() {
        let f = fixture(&[&[(LOCAL, 100)], &[("b", 100)], &[("c", 100)]], 90.0).await;
        let target = node(&f.cluster, 0);
        assert!(f.cluster.local_corpus_dispatch_target().is_some());

        target.set_active_documents(10);
        f.cluster.ping_iteration_completed();
        assert!(f.cluster.local_corpus_dispatch_target().is_none());
        assert_eq!(f.vip.cluster_status("test"), Some(false));

        target.set_active_documents(100);
        f.cluster.ping_iteration_completed();
        assert!(f.cluster.local_corpus_dispatch_target().is_some());
        assert_eq!(f.vip.cluster_status("test"), Some(true));

        f.cluster.failed(&target);
        assert!(f.cluster.local_corpus_dispatch_target().is_none());
    }

    #[tokio::test]
    async fn test_single_node_cluster_stays_in_rotation() {
        let f = fixture(&[&[(LOCAL, 100)]], 97.0).await;
        let target = node(&f.cluster, 0);
        assert!(f.vip.is_in_rotation());

        f.cluster.failed(&target);
        assert!(f.vip.is_in_rotation());
    }

    #[tokio::test]
    async fn test_failing_target_in_larger_cluster_leaves_rotation() {
        let f = fixture(&[&[(LOCAL, 100)], &[("b", 100)]], 97.0).await;
        let target = node(&f.cluster, 0);
        assert!(f.vip.is_in_rotation());

        f.cluster.failed(&target);
        assert!(!f.vip.is_in_rotation());

        f.cluster.working(&target);
        assert!(f.vip.is_in_rotation());
    }

    #[tokio::test]
    async fn test_other_node_does_not_affect_target_rotation() {
        let f = fixture(&[&[(LOCAL, 100)], &[("b", 100)]], 97.0).await;
        f.cluster.failed(&node(&f.cluster, 1));
        assert!(f.vip.is_in_rotation());
    }

    #[tokio::test]
    async fn test_whole_cluster_rotation_without_local_target() {
        let f = fixture(&[&[("a", 100)], &[("b", 100)]], 97.0).await;
        assert!(f.vip.is_in_rotation());

        f.cluster.failed(&node(&f.cluster, 0));
        assert!(f.vip.is_in_rotation());

        f.cluster.failed(&node(&f.cluster, 1));
        assert!(!f.vip.is_in_rotation());

        f.cluster.working(&node(&f.cluster, 1));
        assert!(f.vip.is_in_rotation());
    }

    #[tokio::test]
    async fn test_update_retains_existing_nodes() {
        let f = fixture(&[&[("a", 100)], &[("b", 100)]], 97.0).await;
        let before = node(&f.cluster, 0);

        let nodes = vec![
            Node::new(0, "a", 0),
            Node::new(1, "b", 1),
            Node::new(2, "c", 1),
        ];
        f.cluster.update_nodes(nodes, &f.monitor, 97.0).await.unwrap();

        let after = node(&f.cluster, 0);
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.is_working(), Liveness::Working);
        // the new node has no documents configured, so its pong is an error
        assert_eq!(node(&f.cluster, 2).is_working(), Liveness::Failed);
        assert_eq!(f.cluster.group(1).unwrap().nodes().len(), 2);
        assert_eq!(node(&f.cluster, 2).path_index(), 1);
        assert_eq!(f.monitor.tracked_nodes().len(), 3);
    }

    #[tokio::test]
    async fn test_update_replaces_changed_identity() {
        let f = fixture(&[&[("a", 100)], &[("b", 100)]], 97.0).await;
        let before = node(&f.cluster, 1);

        let nodes = vec![Node::new(0, "a", 0), Node::new(1, "moved", 1)];
        f.cluster.update_nodes(nodes, &f.monitor, 97.0).await.unwrap();

        let after = node(&f.cluster, 1);
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.hostname(), "moved");
        assert_eq!(f.monitor.tracked_nodes().len(), 2);
    }

    #[tokio::test]
    async fn test_update_removes_nodes() {
        let f = fixture(&[&[("a", 100)], &[("b", 100)]], 97.0).await;
        f.cluster
            .update_nodes(vec![Node::new(0, "a", 0)], &f.monitor, 97.0)
            .await
            .unwrap();
        assert_eq!(f.cluster.size(), 1);
        assert!(f.cluster.group(1).is_none());
        assert_eq!(f.monitor.tracked_nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_keys_rejected() {
        let f = fixture(&[&[("a", 100)]], 97.0).await;
        let err = f
            .cluster
            .update_nodes(vec![Node::new(0, "a", 0), Node::new(0, "b", 0)], &f.monitor, 97.0)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTopology(_)));
        assert_eq!(f.cluster.size(), 1);
    }

    #[tokio::test]
    async fn test_non_contiguous_groups_rejected() {
        let f = fixture(&[&[("a", 100)]], 97.0).await;
        let err = f
            .cluster
            .update_nodes(vec![Node::new(0, "a", 0), Node::new(1, "b", 2)], &f.monitor, 97.0)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTopology(_)));
    }

    #[tokio::test]
    async fn test_rejected_update_keeps_path_indexes() {
        let f = fixture(&[&[("a", 100), ("b", 100)]], 97.0).await;
        let indexes = |cluster: &SearchCluster| -> Vec<usize> {
            cluster.group(0).unwrap().nodes().iter().map(|n| n.path_index()).collect()
        };
        assert_eq!(indexes(&f.cluster), vec![0, 1]);

        let err = f
            .cluster
            .update_nodes(vec![Node::new(1, "b", 0), Node::new(2, "c", 2)], &f.monitor, 97.0)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTopology(_)));

        assert_eq!(indexes(&f.cluster), vec![0, 1]);
        assert_eq!(f.cluster.size(), 2);
        assert_eq!(tracked_keys(&f.monitor), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_overlapping_updates_apply_in_start_order() {
        let vip = Arc::new(VipStatus::default());
        let pinger = Arc::new(DelayedPinger {
            delays: HashMap::from([(1, Duration::from_millis(150))]),
        });
        let cluster = Arc::new(SearchCluster::new(&config(97.0), pinger, vip));
        let monitor = Arc::new(ClusterMonitor::new(
            Arc::clone(&cluster) as Arc<dyn NodeManager>,
            Duration::from_secs(60),
        ));
        cluster
            .update_nodes(vec![Node::new(0, "a", 0)], &monitor, 97.0)
            .await
            .unwrap();

        let slow_update = {
            let cluster = Arc::clone(&cluster);
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move {
                let nodes = vec![Node::new(0, "a", 0), Node::new(1, "slow", 1)];
                cluster.update_nodes(nodes, &monitor, 97.0).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let nodes = vec![Node::new(0, "a", 0), Node::new(2, "fast", 1)];
        cluster.update_nodes(nodes, &monitor, 97.0).await.unwrap();
        slow_update.await.unwrap().unwrap();

        let published: Vec<String> =
            cluster.groups().nodes().map(|n| n.hostname().to_string()).collect();
        assert_eq!(published, vec!["a", "fast"]);
        assert_eq!(tracked_keys(&monitor), vec![0, 2]);
        assert_eq!(node(&cluster, 2).is_working(), Liveness::Working);
        assert!(cluster.has_information_about_all_nodes());
    }

    #[tokio::test]
    async fn test_update_times_out_on_silent_nodes() {
        let vip = Arc::new(VipStatus::default());
        let (cluster, monitor) = silent_cluster(vip.clone());

        let started = Instant::now();
        cluster
            .update_nodes(vec![Node::new(0, "a", 0), Node::new(1, "b", 1)], &monitor, 97.0)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));

        assert_eq!(cluster.size(), 2);
        assert!(!cluster.has_information_about_all_nodes());
        assert_eq!(vip.cluster_status("test"), None);
        assert_eq!(cluster.groups_with_sufficient_coverage().len(), 2);
    }

    #[tokio::test]
    async fn test_coverage_logs_wait_for_all_liveness() {
        let vip = Arc::new(VipStatus::default());
        let (cluster, monitor) = silent_cluster(vip);
        cluster
            .update_nodes(vec![Node::new(0, "a", 0), Node::new(1, "b", 1)], &monitor, 97.0)
            .await
            .unwrap();
        let logs = CapturedLogs::default();

        logs.during(|| {
            let a = node(&cluster, 0);
            a.set_active_documents(100);
            cluster.working(&a);
            cluster.ping_iteration_completed();
        });
        assert!(logs.lines("coverage").is_empty());

        logs.during(|| {
            cluster.failed(&node(&cluster, 1));
            cluster.ping_iteration_completed();
        });
        let reduced = logs.lines("group 1 has reduced coverage");
        assert_eq!(reduced.len(), 1);
        assert!(reduced[0].contains("INFO"));
    }

    #[tokio::test]
    async fn test_coverage_logs_edges_rate_limit_and_levels() {
        let layout: Vec<Vec<(&str, u64)>> = (0..5).map(|_| vec![("n", 100), ("n", 100)]).collect();
        let layout: Vec<&[(&str, u64)]> = layout.iter().map(|g| g.as_slice()).collect();
        let f = fixture(&layout, 90.0).await;
        let logs = CapturedLogs::default();

        // one unresponsive node: logged once at info, then rate limited
        logs.during(|| {
            f.cluster.failed(&node(&f.cluster, 1));
            f.cluster.ping_iteration_completed();
            f.cluster.ping_iteration_completed();
            f.cluster.ping_iteration_completed();
        });
        let reduced = logs.lines("group 0 has reduced coverage");
        assert_eq!(reduced.len(), 1);
        assert!(reduced[0].contains("INFO"));
        assert!(reduced[0].contains("working nodes: 1/2"));

        // two unresponsive nodes in a newly reduced group: warn
        logs.during(|| {
            f.cluster.failed(&node(&f.cluster, 2));
            f.cluster.failed(&node(&f.cluster, 3));
            f.cluster.ping_iteration_completed();
        });
        let reduced = logs.lines("group 1 has reduced coverage");
        assert_eq!(reduced.len(), 1);
        assert!(reduced[0].contains("WARN"));
        assert_eq!(logs.lines("group 0 has reduced coverage").len(), 1);

        // recovery is an edge and is logged regardless of the rate limit
        logs.during(|| {
            let recovered = node(&f.cluster, 1);
            recovered.set_active_documents(100);
            f.cluster.working(&recovered);
            f.cluster.ping_iteration_completed();
        });
        let full = logs.lines("group 0 has full coverage");
        assert_eq!(full.len(), 1);
        assert!(full[0].contains("INFO"));
        assert_eq!(logs.lines("group 1 has reduced coverage").len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_summary_serializes() {
        let f = fixture(&[&[("a", 100), ("b", 90)]], 97.0).await;
        let summary = f.cluster.dispatch_summary();
        assert_eq!(summary.groups.len(), 1);
        assert_eq!(summary.groups[0].active_documents, 190);
        assert!(summary.groups[0].balanced);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["cluster_id"], "test");
        assert_eq!(json["groups"][0]["nodes"][1]["liveness"], "working");
    }

    #[test]
    fn test_find_local_target() {
        let solo = SearchGroups::from_nodes(
            vec![
                Arc::new(Node::new(0, LOCAL, 0)),
                Arc::new(Node::new(1, "other", 1)),
            ],
            97.0,
        );
        assert_eq!(find_local_corpus_dispatch_target(LOCAL, &solo).unwrap().key(), 0);
        assert!(find_local_corpus_dispatch_target("nowhere", &solo).is_none());

        let shared = SearchGroups::from_nodes(
            vec![
                Arc::new(Node::new(0, LOCAL, 0)),
                Arc::new(Node::new(1, "other", 0)),
            ],
            97.0,
        );
        assert!(find_local_corpus_dispatch_target(LOCAL, &shared).is_none());
    }
}
