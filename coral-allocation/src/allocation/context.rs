//! Per-pass transaction context
//!
//! A `RoutingAllocation` is constructed at the start of every public
//! operation and dropped at commit. It owns the mutable working view and
//! carries everything a pass is allowed to read: the input snapshot, the
//! decider stack, the resource oracle, and the clock captured exactly once.

use crate::allocation::explain::RoutingExplanations;
use crate::cluster::{ClusterState, DiscoveryNodes, Metadata};
use crate::deciders::AllocationDeciders;
use crate::info::ClusterInfo;
use crate::routing::{RoutingNodes, RoutingTable, ShardId};
use crate::settings::AllocationSettings;
use std::collections::{BTreeMap, BTreeSet};

/// Mutable context of one reroute pass
pub struct RoutingAllocation<'a> {
    deciders: &'a AllocationDeciders,
    nodes: &'a DiscoveryNodes,
    metadata: &'a Metadata,
    routing_table: &'a RoutingTable,
    settings: &'a AllocationSettings,
    info: ClusterInfo,
    routing_nodes: RoutingNodes,
    current_nanos: i64,
    current_millis: i64,
    /// Nodes a shard failed on during this pass; deciders refuse them
    ignored: BTreeMap<String, BTreeSet<ShardId>>,
    debug_decision: bool,
    ignore_disable: bool,
    retry_failed: bool,
    explanations: RoutingExplanations,
}

impl<'a> RoutingAllocation<'a> {
    pub fn new(
        deciders: &'a AllocationDeciders,
        state: &'a ClusterState,
        settings: &'a AllocationSettings,
        info: ClusterInfo,
        current_nanos: i64,
        current_millis: i64,
    ) -> Self {
        Self {
            deciders,
            nodes: &state.nodes,
            metadata: state.metadata.as_ref(),
            routing_table: state.routing_table.as_ref(),
            settings,
            info,
            routing_nodes: RoutingNodes::from_state(&state.routing_table, &state.nodes),
            current_nanos,
            current_millis,
            ignored: BTreeMap::new(),
            debug_decision: false,
            ignore_disable: false,
            retry_failed: false,
            explanations: RoutingExplanations::new(),
        }
    }

    pub fn deciders(&self) -> &'a AllocationDeciders {
        self.deciders
    }

    /// Live nodes of the input snapshot
    pub fn nodes(&self) -> &'a DiscoveryNodes {
        self.nodes
    }

    pub fn metadata(&self) -> &'a Metadata {
        self.metadata
    }

    /// The original, untouched routing table
    pub fn routing_table(&self) -> &'a RoutingTable {
        self.routing_table
    }

    pub fn settings(&self) -> &'a AllocationSettings {
        self.settings
    }

    pub fn info(&self) -> &ClusterInfo {
        &self.info
    }

    pub fn routing_nodes(&self) -> &RoutingNodes {
        &self.routing_nodes
    }

    pub fn routing_nodes_mut(&mut self) -> &mut RoutingNodes {
        &mut self.routing_nodes
    }

    /// Pass clock, fixed at construction
    pub fn current_nanos(&self) -> i64 {
        self.current_nanos
    }

    pub fn current_millis(&self) -> i64 {
        self.current_millis
    }

    /// Remember that `shard_id` failed on `node_id` during this pass
    pub fn add_ignored(&mut self, node_id: &str, shard_id: ShardId) {
        self.ignored
            .entry(node_id.to_string())
            .or_default()
            .insert(shard_id);
    }

    pub fn is_ignored(&self, node_id: &str, shard_id: &ShardId) -> bool {
        self.ignored
            .get(node_id)
            .map(|set| set.contains(shard_id))
            .unwrap_or(false)
    }

    /// Whether deciders must produce full per-step explanations
    pub fn debug_decision(&self) -> bool {
        self.debug_decision
    }

    pub fn set_debug_decision(&mut self, debug: bool) {
        self.debug_decision = debug;
    }

    /// Whether the allocation-enable gate is bypassed (command execution)
    pub fn ignore_disable(&self) -> bool {
        self.ignore_disable
    }

    pub fn set_ignore_disable(&mut self, ignore: bool) {
        self.ignore_disable = ignore;
    }

    /// Whether the max-retry gate is bypassed
    pub fn retry_failed(&self) -> bool {
        self.retry_failed
    }

    pub fn set_retry_failed(&mut self, retry: bool) {
        self.retry_failed = retry;
    }

    pub fn explanations(&self) -> &RoutingExplanations {
        &self.explanations
    }

    pub fn explanations_mut(&mut self) -> &mut RoutingExplanations {
        &mut self.explanations
    }

    pub fn take_explanations(&mut self) -> RoutingExplanations {
        std::mem::take(&mut self.explanations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{DiscoveryNode, IndexMetadata};

    fn make_state() -> ClusterState {
        let meta = IndexMetadata::new("logs", 2, 1);
        let mut table = RoutingTable::new(0);
        table.add_index_as_new(&meta, 0, 0);
        ClusterState::new(
            "test",
            1,
            DiscoveryNodes::new([DiscoveryNode::new("node-1")]),
            Metadata::new([meta]),
            table,
        )
    }

    #[test]
    fn test_ignore_set_is_per_node() {
        let state = make_state();
        let deciders = AllocationDeciders::new(vec![]);
        let settings = AllocationSettings::default();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, &settings, ClusterInfo::default(), 0, 0);

        let shard_id = state.routing_table.all_shards().next().unwrap().shard_id.clone();
        assert!(!allocation.is_ignored("node-1", &shard_id));

        allocation.add_ignored("node-1", shard_id.clone());
        assert!(allocation.is_ignored("node-1", &shard_id));
        assert!(!allocation.is_ignored("node-2", &shard_id));
    }

    #[test]
    fn test_working_view_mirrors_snapshot() {
        let state = make_state();
        let deciders = AllocationDeciders::new(vec![]);
        let settings = AllocationSettings::default();
        let allocation =
            RoutingAllocation::new(&deciders, &state, &settings, ClusterInfo::default(), 42, 7);

        assert_eq!(allocation.current_nanos(), 42);
        assert_eq!(allocation.current_millis(), 7);
        assert_eq!(allocation.routing_nodes().unassigned().len(), 4);
        assert!(allocation.routing_nodes().node("node-1").is_some());
    }
}
