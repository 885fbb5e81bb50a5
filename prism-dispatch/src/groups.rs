//! Immutable snapshot of the cluster topology
//!
//! [`SearchGroups`] maps group ids to groups together with the coverage
//! policy. A snapshot is never modified after construction; topology changes
//! build a new one which the coordinator publishes as a unit.

use crate::group::Group;
use crate::node::Node;
use std::collections::BTreeMap;
use std::sync::Arc;

/// All groups of a search cluster plus the coverage policy
#[derive(Debug)]
pub struct SearchGroups {
    groups: BTreeMap<u32, Arc<Group>>,
    min_active_docs_percentage: f64,
}

impl SearchGroups {
    /// Create a snapshot from already built groups
    pub fn new(groups: Vec<Group>, min_active_docs_percentage: f64) -> Self {
        Self {
            groups: groups.into_iter().map(|g| (g.id(), Arc::new(g))).collect(),
            min_active_docs_percentage,
        }
    }

    /// Partition nodes into groups by their group id, keeping node order
    pub fn from_nodes(nodes: Vec<Arc<Node>>, min_active_docs_percentage: f64) -> Self {
        let mut by_group: BTreeMap<u32, Vec<Arc<Node>>> = BTreeMap::new();
        for node in nodes {
            by_group.entry(node.group()).or_default().push(node);
        }
        let groups = by_group
            .into_iter()
            .map(|(id, nodes)| Group::new(id, nodes))
            .collect();
        Self::new(groups, min_active_docs_percentage)
    }

    /// An empty snapshot, used before the first topology is published
    pub fn empty(min_active_docs_percentage: f64) -> Self {
        Self::new(Vec::new(), min_active_docs_percentage)
    }

    pub fn get(&self, id: u32) -> Option<&Arc<Group>> {
        self.groups.get(&id)
    }

    /// Groups ordered by id
    pub fn groups(&self) -> impl Iterator<Item = &Arc<Group>> {
        self.groups.values()
    }

    pub fn size(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// All nodes of all groups, in group order
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.groups.values().flat_map(|g| g.nodes().iter())
    }

    pub fn min_active_docs_percentage(&self) -> f64 {
        self.min_active_docs_percentage
    }

    /// Median of active documents per group; the mean of the two middle
    /// groups when the group count is even
    pub fn median_documents_per_group(&self) -> u64 {
        if self.groups.is_empty() {
            return 0;
        }
        let mut documents: Vec<u64> = self.groups().map(|g| g.active_documents()).collect();
        documents.sort_unstable();

        let mid = documents.len() / 2;
        if documents.len() % 2 == 1 {
            documents[mid]
        } else {
            let (low, high) = (documents[mid - 1], documents[mid]);
            low / 2 + high / 2 + (low % 2 + high % 2) / 2
        }
    }

    /// Whether `active_documents` is enough, relative to `reference_documents`,
    /// for a group to serve queries
    pub fn is_group_coverage_sufficient(
        &self,
        active_documents: u64,
        reference_documents: u64,
    ) -> bool {
        if self.size() == 1 || reference_documents == 0 {
            return true;
        }
        let coverage = 100.0 * active_documents as f64 / reference_documents as f64;
        coverage >= self.min_active_docs_percentage
    }

    /// Coverage check for a subset of a group's nodes, against the median group
    pub fn is_partial_group_coverage_sufficient(&self, nodes: &[Arc<Node>]) -> bool {
        if self.size() == 1 {
            return true;
        }
        let active: u64 = nodes.iter().map(|n| n.active_documents()).sum();
        self.is_group_coverage_sufficient(active, self.median_documents_per_group())
    }
}
