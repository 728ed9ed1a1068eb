//! Mutable routing view: the shard-level state machine
//!
//! `RoutingNodes` is the working copy a reroute pass mutates. It is built from
//! an immutable routing table at the start of a pass, exclusively owned by
//! that pass, and turned back into an immutable table at commit. All state
//! transitions preserve the routing invariants: one primary per group, one
//! copy per node, paired relocation halves, unique allocation ids.

use super::allocation_id::AllocationId;
use super::shard::{ShardId, ShardRouting, ShardRoutingState};
use super::table::{IndexRoutingTable, RoutingTable, ShardRoutingTable};
use super::unassigned::{UnassignedInfo, UnassignedReason, UnassignedShards};
use crate::cluster::{DiscoveryNodes, Metadata};
use crate::error::{AllocationError, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Shards currently assigned to one node
#[derive(Debug, Clone)]
pub struct RoutingNode {
    node_id: String,
    shards: BTreeMap<ShardId, ShardRouting>,
}

impl RoutingNode {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            shards: BTreeMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn get(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.shards.get(shard_id)
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.values()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Copies of one index on this node
    pub fn index_shard_count(&self, index_name: &str) -> usize {
        self.shards
            .values()
            .filter(|s| s.shard_id.index_name() == index_name)
            .count()
    }

    /// Recoveries landing on this node (initializations, including relocation targets)
    pub fn incoming_recoveries(&self) -> usize {
        self.shards.values().filter(|s| s.is_initializing()).count()
    }

    /// Recoveries leaving this node (relocation sources)
    pub fn outgoing_recoveries(&self) -> usize {
        self.shards.values().filter(|s| s.is_relocating()).count()
    }
}

/// The mutable routing view of one reroute pass
#[derive(Debug, Clone)]
pub struct RoutingNodes {
    nodes: BTreeMap<String, RoutingNode>,
    unassigned: UnassignedShards,
    /// Auxiliary by-shard index: which nodes hold a copy
    assigned: BTreeMap<ShardId, BTreeSet<String>>,
}

impl RoutingNodes {
    /// Build the working view: one entry per live data node (so empty nodes
    /// are placement candidates) plus entries for departed nodes that still
    /// hold shards (so they can be deassociated).
    pub fn from_state(table: &RoutingTable, nodes: &DiscoveryNodes) -> Self {
        let mut view = Self {
            nodes: BTreeMap::new(),
            unassigned: UnassignedShards::new(),
            assigned: BTreeMap::new(),
        };
        for node in nodes.data_nodes() {
            view.nodes
                .insert(node.node_id.clone(), RoutingNode::new(&node.node_id));
        }
        for shard in table.all_shards() {
            match shard.current_node.clone() {
                Some(node_id) => {
                    view.nodes
                        .entry(node_id.clone())
                        .or_insert_with(|| RoutingNode::new(&node_id));
                    // Table was validated against metadata; duplicates cannot occur here
                    let _ = view.add_shard(shard.clone());
                }
                None => view.unassigned.push(shard.clone()),
            }
        }
        view
    }

    pub fn node(&self, node_id: &str) -> Option<&RoutingNode> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &RoutingNode> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn unassigned(&self) -> &UnassignedShards {
        &self.unassigned
    }

    pub fn unassigned_mut(&mut self) -> &mut UnassignedShards {
        &mut self.unassigned
    }

    /// Total assigned copies across all nodes
    pub fn total_assigned(&self) -> usize {
        self.nodes.values().map(|n| n.shard_count()).sum()
    }

    pub fn shard_on_node(&self, shard_id: &ShardId, node_id: &str) -> Option<&ShardRouting> {
        self.nodes.get(node_id).and_then(|n| n.get(shard_id))
    }

    /// All assigned copies of a shard group, via the by-shard index
    pub fn assigned_copies(&self, shard_id: &ShardId) -> Vec<&ShardRouting> {
        match self.assigned.get(shard_id) {
            Some(nodes) => nodes
                .iter()
                .filter_map(|n| self.shard_on_node(shard_id, n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// The serving primary of a shard group, if any
    pub fn active_primary(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.assigned_copies(shard_id)
            .into_iter()
            .find(|s| s.primary && s.is_active())
    }

    /// Every assigned copy in the view, in node order
    pub fn assigned_iter(&self) -> impl Iterator<Item = &ShardRouting> {
        self.nodes.values().flat_map(|n| n.shards())
    }

    // ========================================
    // Transitions
    // ========================================

    /// UNASSIGNED → INITIALIZING on `node_id`. A fresh allocation id is minted
    /// unless the shard is recovering a known on-disk copy, in which case the
    /// copy's existing id is reused.
    pub fn initialize(
        &mut self,
        mut shard: ShardRouting,
        node_id: &str,
        existing_allocation_id: Option<&str>,
        expected_size: i64,
    ) -> Result<ShardRouting> {
        if !shard.is_unassigned() {
            return Err(AllocationError::InvalidInput(format!(
                "cannot initialize {}: not unassigned",
                shard.describe()
            )));
        }
        if !self.nodes.contains_key(node_id) {
            return Err(AllocationError::InvalidInput(format!(
                "cannot initialize {} on unknown node {}",
                shard.shard_id, node_id
            )));
        }
        shard.state = ShardRoutingState::Initializing;
        shard.current_node = Some(node_id.to_string());
        shard.relocating_node = None;
        shard.allocation_id = Some(match existing_allocation_id {
            Some(id) => AllocationId::existing(id),
            None => AllocationId::fresh(),
        });
        shard.expected_size_bytes = expected_size;
        self.add_shard(shard.clone())?;
        Ok(shard)
    }

    /// INITIALIZING → STARTED. Completing a relocation target atomically
    /// removes the paired relocating source.
    pub fn start_shard(&mut self, routing: &ShardRouting) -> Result<ShardRouting> {
        let node_id = routing.current_node.clone().ok_or_else(|| {
            AllocationError::InvalidInput(format!("cannot start unassigned {}", routing.shard_id))
        })?;
        let current = self
            .shard_on_node(&routing.shard_id, &node_id)
            .cloned()
            .filter(|c| c.is_same_allocation(routing))
            .ok_or_else(|| {
                AllocationError::InvalidInput(format!(
                    "started shard {} not found on node {}",
                    routing.shard_id, node_id
                ))
            })?;
        if !current.is_initializing() {
            return Err(AllocationError::InvalidInput(format!(
                "cannot start {}: not initializing",
                current.describe()
            )));
        }

        if let Some(source_node) = current.relocating_node.clone() {
            if self.remove_shard(&current.shard_id, &source_node).is_none() {
                warn!(
                    shard = %current.shard_id,
                    source = %source_node,
                    "relocation source missing while starting target"
                );
            }
        }

        let updated = {
            let shard = self
                .get_mut(&current.shard_id, &node_id)
                .ok_or_else(|| AllocationError::InvariantViolation("copy vanished".into()))?;
            shard.state = ShardRoutingState::Started;
            shard.relocating_node = None;
            shard.allocation_id = shard.allocation_id.as_ref().map(|a| a.without_relocation());
            shard.unassigned_info = None;
            shard.clone()
        };
        Ok(updated)
    }

    /// STARTED → RELOCATING, creating the paired INITIALIZING target copy
    pub fn relocate(
        &mut self,
        routing: &ShardRouting,
        target_node: &str,
        expected_size: i64,
    ) -> Result<()> {
        let source_node = routing.current_node.clone().ok_or_else(|| {
            AllocationError::InvalidInput(format!("cannot relocate unassigned {}", routing.shard_id))
        })?;
        let current = self
            .shard_on_node(&routing.shard_id, &source_node)
            .cloned()
            .filter(|c| c.is_same_allocation(routing))
            .ok_or_else(|| {
                AllocationError::InvalidInput(format!(
                    "shard {} not found on node {}",
                    routing.shard_id, source_node
                ))
            })?;
        if !current.is_started() {
            return Err(AllocationError::InvalidInput(format!(
                "cannot relocate {}: not started",
                current.describe()
            )));
        }
        if !self.nodes.contains_key(target_node) {
            return Err(AllocationError::InvalidInput(format!(
                "cannot relocate {} to unknown node {}",
                current.shard_id, target_node
            )));
        }
        if self.shard_on_node(&current.shard_id, target_node).is_some() {
            return Err(AllocationError::InvalidInput(format!(
                "node {} already holds a copy of {}",
                target_node, current.shard_id
            )));
        }

        let target_id = uuid::Uuid::new_v4().to_string();
        let source_allocation = current.allocation_id.clone().ok_or_else(|| {
            AllocationError::InvariantViolation(format!(
                "started shard {} has no allocation id",
                current.shard_id
            ))
        })?;

        {
            let source = self
                .get_mut(&current.shard_id, &source_node)
                .ok_or_else(|| AllocationError::InvariantViolation("copy vanished".into()))?;
            source.state = ShardRoutingState::Relocating;
            source.relocating_node = Some(target_node.to_string());
            source.allocation_id = Some(source_allocation.as_relocation_source(&target_id));
        }

        let target = ShardRouting {
            shard_id: current.shard_id.clone(),
            primary: current.primary,
            state: ShardRoutingState::Initializing,
            current_node: Some(target_node.to_string()),
            relocating_node: Some(source_node.clone()),
            allocation_id: Some(AllocationId::relocation_target(&source_allocation, &target_id)),
            unassigned_info: None,
            expected_size_bytes: expected_size,
        };
        self.add_shard(target)?;

        crate::metrics::record_relocation(
            current.shard_id.index_name(),
            &source_node,
            target_node,
        );
        Ok(())
    }

    /// RELOCATING → STARTED, removing the paired INITIALIZING target
    pub fn cancel_relocation(&mut self, routing: &ShardRouting) -> Result<()> {
        let source_node = routing.current_node.clone().ok_or_else(|| {
            AllocationError::InvalidInput(format!("{} is unassigned", routing.shard_id))
        })?;
        let current = self
            .shard_on_node(&routing.shard_id, &source_node)
            .cloned()
            .filter(|c| c.is_same_allocation(routing))
            .ok_or_else(|| {
                AllocationError::InvalidInput(format!(
                    "shard {} not found on node {}",
                    routing.shard_id, source_node
                ))
            })?;
        if !current.is_relocating() {
            return Err(AllocationError::InvalidInput(format!(
                "cannot cancel relocation of {}: not relocating",
                current.describe()
            )));
        }

        if let Some(target_node) = current.relocating_node.clone() {
            self.remove_shard(&current.shard_id, &target_node);
        }
        if let Some(source) = self.get_mut(&current.shard_id, &source_node) {
            source.state = ShardRoutingState::Started;
            source.relocating_node = None;
            source.allocation_id = source.allocation_id.as_ref().map(|a| a.without_relocation());
        }
        Ok(())
    }

    /// Any assigned state → UNASSIGNED.
    ///
    /// Failing a primary cascades to its initializing replicas; failing an
    /// active primary with a promotable replica promotes that replica in the
    /// same call and demotes the failed copy to a replica with reason
    /// `PRIMARY_FAILED`. Stale references (copies already removed by an
    /// earlier cascade in the same batch) are a no-op.
    pub fn fail_shard(&mut self, routing: &ShardRouting, unassigned_info: UnassignedInfo) -> Result<()> {
        let Some(node_id) = routing.current_node.clone() else {
            return Err(AllocationError::InvalidInput(format!(
                "cannot fail unassigned shard {}",
                routing.shard_id
            )));
        };
        let Some(current) = self
            .shard_on_node(&routing.shard_id, &node_id)
            .cloned()
            .filter(|c| c.is_same_allocation(routing))
        else {
            return Ok(());
        };

        if current.primary && !current.is_relocation_target() {
            self.fail_initializing_replicas(&current.shard_id, &unassigned_info);
        }

        match current.state {
            ShardRoutingState::Unassigned => Ok(()),
            ShardRoutingState::Initializing if current.is_relocation_target() => {
                // Failed relocation target: the source resumes serving
                self.remove_shard(&current.shard_id, &node_id);
                if let Some(source_node) = current.relocating_node.clone() {
                    if let Some(source) = self.get_mut(&current.shard_id, &source_node) {
                        source.state = ShardRoutingState::Started;
                        source.relocating_node = None;
                        source.allocation_id =
                            source.allocation_id.as_ref().map(|a| a.without_relocation());
                    }
                }
                Ok(())
            }
            ShardRoutingState::Initializing | ShardRoutingState::Started => {
                self.remove_shard(&current.shard_id, &node_id);
                self.push_unassigned(current, unassigned_info);
                Ok(())
            }
            ShardRoutingState::Relocating => {
                if let Some(target_node) = current.relocating_node.clone() {
                    self.remove_shard(&current.shard_id, &target_node);
                }
                self.remove_shard(&current.shard_id, &node_id);
                self.push_unassigned(current, unassigned_info);
                Ok(())
            }
        }
    }

    /// Remove an empty node entry from the view
    pub fn remove_node(&mut self, node_id: &str) -> Result<()> {
        if let Some(node) = self.nodes.get(node_id) {
            if !node.is_empty() {
                return Err(AllocationError::InvariantViolation(format!(
                    "cannot remove node {} still holding {} shards",
                    node_id,
                    node.shard_count()
                )));
            }
        }
        self.nodes.remove(node_id);
        Ok(())
    }

    /// Cascade a primary failure into its initializing replicas: in-flight
    /// replica relocations are cancelled, fresh replica recoveries are
    /// returned to the unassigned queue with reason `PRIMARY_FAILED`.
    fn fail_initializing_replicas(&mut self, shard_id: &ShardId, parent: &UnassignedInfo) {
        let replicas: Vec<ShardRouting> = self
            .assigned_copies(shard_id)
            .into_iter()
            .filter(|s| !s.primary && s.is_initializing())
            .cloned()
            .collect();

        for replica in replicas {
            let Some(node_id) = replica.current_node.clone() else {
                continue;
            };
            if replica.is_relocation_target() {
                if let Some(source_node) = replica.relocating_node.clone() {
                    self.remove_shard(shard_id, &node_id);
                    if let Some(source) = self.get_mut(shard_id, &source_node) {
                        source.state = ShardRoutingState::Started;
                        source.relocating_node = None;
                        source.allocation_id =
                            source.allocation_id.as_ref().map(|a| a.without_relocation());
                    }
                }
            } else {
                self.remove_shard(shard_id, &node_id);
                let info = UnassignedInfo::new(
                    UnassignedReason::PrimaryFailed,
                    parent.unassigned_since_nanos,
                    parent.unassigned_since_millis,
                )
                .with_message("primary failed while replica was initializing")
                .with_failed_allocations(
                    replica
                        .unassigned_info
                        .as_ref()
                        .map(|i| i.failed_allocations)
                        .unwrap_or(0),
                );
                let mut copy = replica;
                copy.state = ShardRoutingState::Unassigned;
                copy.current_node = None;
                copy.relocating_node = None;
                copy.allocation_id = None;
                copy.expected_size_bytes = ShardRouting::UNKNOWN_EXPECTED_SIZE;
                copy.unassigned_info = Some(info);
                self.unassigned.push(copy);
            }
        }
    }

    /// Move a removed copy to the unassigned queue, promoting a replacement
    /// primary first when one exists.
    fn push_unassigned(&mut self, mut copy: ShardRouting, mut info: UnassignedInfo) {
        if copy.primary {
            if let Some((candidate_node, candidate_id)) = self.promotable_replica(&copy.shard_id) {
                self.promote(&copy.shard_id, &candidate_node);
                info!(
                    shard = %copy.shard_id,
                    node = %candidate_node,
                    allocation_id = %candidate_id,
                    "promoted replica to primary"
                );
                crate::metrics::record_primary_promotion(copy.shard_id.index_name());
                copy.primary = false;
                info.reason = UnassignedReason::PrimaryFailed;
            }
        }
        copy.state = ShardRoutingState::Unassigned;
        copy.current_node = None;
        copy.relocating_node = None;
        copy.allocation_id = None;
        copy.expected_size_bytes = ShardRouting::UNKNOWN_EXPECTED_SIZE;
        copy.unassigned_info = Some(info);
        self.unassigned.push(copy);
    }

    /// The replica to promote when the primary fails: the active replica with
    /// the lexicographically smallest allocation id. Relocation targets are
    /// skipped; their sources are candidates instead.
    fn promotable_replica(&self, shard_id: &ShardId) -> Option<(String, String)> {
        self.assigned_copies(shard_id)
            .into_iter()
            .filter(|s| !s.primary && s.is_active() && !s.is_relocation_target())
            .filter_map(|s| {
                let node = s.current_node.clone()?;
                let id = s.allocation_id_str()?.to_string();
                Some((id, node))
            })
            .min()
            .map(|(id, node)| (node, id))
    }

    fn promote(&mut self, shard_id: &ShardId, node_id: &str) {
        let relocation_target = match self.get_mut(shard_id, node_id) {
            Some(shard) => {
                shard.primary = true;
                shard.relocating_node.clone().filter(|_| shard.is_relocating())
            }
            None => None,
        };
        // A relocating replica's target half becomes a primary target too
        if let Some(target_node) = relocation_target {
            if let Some(target) = self.get_mut(shard_id, &target_node) {
                target.primary = true;
            }
        }
    }

    // ========================================
    // Internal bookkeeping
    // ========================================

    fn add_shard(&mut self, shard: ShardRouting) -> Result<()> {
        let node_id = shard.current_node.clone().ok_or_else(|| {
            AllocationError::InvariantViolation("cannot place unassigned copy on a node".into())
        })?;
        let node = self.nodes.get_mut(&node_id).ok_or_else(|| {
            AllocationError::InvalidInput(format!("unknown node {}", node_id))
        })?;
        if node.shards.contains_key(&shard.shard_id) {
            return Err(AllocationError::InvariantViolation(format!(
                "node {} already holds a copy of {}",
                node_id, shard.shard_id
            )));
        }
        self.assigned
            .entry(shard.shard_id.clone())
            .or_default()
            .insert(node_id.clone());
        node.shards.insert(shard.shard_id.clone(), shard);
        Ok(())
    }

    fn remove_shard(&mut self, shard_id: &ShardId, node_id: &str) -> Option<ShardRouting> {
        let removed = self.nodes.get_mut(node_id)?.shards.remove(shard_id);
        if removed.is_some() {
            if let Some(holders) = self.assigned.get_mut(shard_id) {
                holders.remove(node_id);
                if holders.is_empty() {
                    self.assigned.remove(shard_id);
                }
            }
        }
        removed
    }

    fn get_mut(&mut self, shard_id: &ShardId, node_id: &str) -> Option<&mut ShardRouting> {
        self.nodes.get_mut(node_id)?.shards.get_mut(shard_id)
    }

    // ========================================
    // Commit support
    // ========================================

    /// Turn the view back into an immutable table. The unassigned queue must
    /// have its ignored shards resolved first.
    pub fn to_routing_table(&self, version: u64, metadata: &Metadata) -> RoutingTable {
        let mut groups: BTreeMap<ShardId, Vec<ShardRouting>> = BTreeMap::new();
        for shard in self.assigned_iter() {
            groups
                .entry(shard.shard_id.clone())
                .or_default()
                .push(shard.clone());
        }
        for shard in self.unassigned.iter_all() {
            groups
                .entry(shard.shard_id.clone())
                .or_default()
                .push(shard.clone());
        }

        let mut indices: BTreeMap<String, BTreeMap<u32, ShardRoutingTable>> = BTreeMap::new();
        for (shard_id, copies) in groups {
            indices
                .entry(shard_id.index_name().to_string())
                .or_default()
                .insert(shard_id.id, ShardRoutingTable::new(shard_id, copies));
        }

        let tables = indices.into_iter().filter_map(|(name, shards)| {
            let index = metadata.index(&name)?.index.clone();
            Some(IndexRoutingTable::new(index, shards))
        });
        RoutingTable::from_indices(version, tables)
    }

    /// Verify the routing invariants over the whole view. Called before
    /// commit; a violation means the pass produced a corrupt state.
    pub fn validate(&self, metadata: &Metadata) -> Result<()> {
        let mut groups: BTreeMap<ShardId, Vec<&ShardRouting>> = BTreeMap::new();
        for (node_id, node) in &self.nodes {
            for shard in node.shards() {
                if shard.current_node.as_deref() != Some(node_id.as_str()) {
                    return Err(AllocationError::InvariantViolation(format!(
                        "{} filed under node {} but current_node is {:?}",
                        shard.shard_id, node_id, shard.current_node
                    )));
                }
                if shard.is_unassigned() || shard.allocation_id.is_none() {
                    return Err(AllocationError::InvariantViolation(format!(
                        "assigned copy {} has unassigned shape",
                        shard.describe()
                    )));
                }
                groups.entry(shard.shard_id.clone()).or_default().push(shard);
            }
        }
        for shard in self.unassigned.iter_all() {
            if !shard.is_unassigned()
                || shard.current_node.is_some()
                || shard.allocation_id.is_some()
                || shard.unassigned_info.is_none()
            {
                return Err(AllocationError::InvariantViolation(format!(
                    "queued copy {} has assigned shape",
                    shard.describe()
                )));
            }
            groups.entry(shard.shard_id.clone()).or_default().push(shard);
        }

        for (shard_id, copies) in &groups {
            let meta = metadata.index_required(shard_id.index_name()).map_err(|_| {
                AllocationError::InvariantViolation(format!(
                    "shard {} has no index metadata",
                    shard_id
                ))
            })?;

            let logical: Vec<_> = copies.iter().filter(|s| !s.is_relocation_target()).collect();
            if logical.len() != meta.total_copies() as usize {
                return Err(AllocationError::InvariantViolation(format!(
                    "shard {} has {} logical copies, expected {}",
                    shard_id,
                    logical.len(),
                    meta.total_copies()
                )));
            }
            if logical.iter().filter(|s| s.primary).count() != 1 {
                return Err(AllocationError::InvariantViolation(format!(
                    "shard {} does not have exactly one primary",
                    shard_id
                )));
            }

            let mut ids = BTreeSet::new();
            for copy in copies {
                if let Some(id) = copy.allocation_id_str() {
                    if !ids.insert(id) {
                        return Err(AllocationError::InvariantViolation(format!(
                            "shard {} has duplicate allocation id {}",
                            shard_id, id
                        )));
                    }
                }
            }

            let has_active_primary = copies.iter().any(|s| s.primary && s.is_active());
            for copy in copies {
                match copy.state {
                    ShardRoutingState::Relocating => {
                        let paired = copy.relocating_node.as_ref().and_then(|target| {
                            self.shard_on_node(shard_id, target)
                        });
                        match paired {
                            Some(target)
                                if target.is_relocation_target()
                                    && target.is_relocation_target_of(copy) => {}
                            _ => {
                                return Err(AllocationError::InvariantViolation(format!(
                                    "relocating {} has no paired target",
                                    copy.describe()
                                )))
                            }
                        }
                    }
                    ShardRoutingState::Initializing if copy.is_relocation_target() => {
                        let paired = copy.relocating_node.as_ref().and_then(|source| {
                            self.shard_on_node(shard_id, source)
                        });
                        if !matches!(paired, Some(source) if source.is_relocating()) {
                            return Err(AllocationError::InvariantViolation(format!(
                                "relocation target {} has no relocating source",
                                copy.describe()
                            )));
                        }
                    }
                    ShardRoutingState::Initializing if !copy.primary => {
                        if !has_active_primary {
                            return Err(AllocationError::InvariantViolation(format!(
                                "replica {} initializing without an active primary",
                                copy.describe()
                            )));
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{DiscoveryNode, IndexMetadata};

    fn make_view(replicas: u32, nodes: &[&str]) -> (RoutingNodes, Metadata, ShardId) {
        let meta = IndexMetadata::new("logs", 1, replicas);
        let shard_id = ShardId::new(meta.index.clone(), 0);
        let metadata = Metadata::new([meta.clone()]);
        let mut table = RoutingTable::new(0);
        table.add_index_as_new(&meta, 0, 0);
        let discovery = DiscoveryNodes::new(nodes.iter().map(|n| DiscoveryNode::new(n)));
        (RoutingNodes::from_state(&table, &discovery), metadata, shard_id)
    }

    fn info() -> UnassignedInfo {
        UnassignedInfo::new(UnassignedReason::AllocationFailed, 0, 0)
    }

    fn start_primary(view: &mut RoutingNodes, node: &str) -> ShardRouting {
        let shard = view
            .unassigned_mut()
            .remove_first(|s| s.primary)
            .expect("primary queued");
        let initializing = view.initialize(shard, node, None, -1).unwrap();
        view.start_shard(&initializing).unwrap()
    }

    fn start_replica(view: &mut RoutingNodes, node: &str) -> ShardRouting {
        let shard = view
            .unassigned_mut()
            .remove_first(|s| !s.primary)
            .expect("replica queued");
        let initializing = view.initialize(shard, node, None, -1).unwrap();
        view.start_shard(&initializing).unwrap()
    }

    #[test]
    fn test_initialize_and_start() {
        let (mut view, metadata, shard_id) = make_view(0, &["node-1"]);
        assert_eq!(view.unassigned().len(), 1);

        let started = start_primary(&mut view, "node-1");
        assert!(started.is_started());
        assert!(started.unassigned_info.is_none());
        assert!(view.unassigned().is_empty());
        assert!(view.active_primary(&shard_id).is_some());
        view.validate(&metadata).unwrap();
    }

    #[test]
    fn test_initialize_on_occupied_node_is_refused() {
        let (mut view, _, _) = make_view(1, &["node-1"]);
        start_primary(&mut view, "node-1");

        let replica = view.unassigned_mut().remove_first(|s| !s.primary).unwrap();
        let err = view.initialize(replica, "node-1", None, -1).unwrap_err();
        assert!(matches!(err, AllocationError::InvariantViolation(_)));
    }

    #[test]
    fn test_relocation_handshake() {
        let (mut view, metadata, shard_id) = make_view(0, &["node-1", "node-2"]);
        let started = start_primary(&mut view, "node-1");

        view.relocate(&started, "node-2", 100).unwrap();
        let source = view.shard_on_node(&shard_id, "node-1").unwrap().clone();
        let target = view.shard_on_node(&shard_id, "node-2").unwrap().clone();
        assert!(source.is_relocating());
        assert!(target.is_relocation_target());
        assert!(target.is_relocation_target_of(&source));
        assert!(target.primary);
        view.validate(&metadata).unwrap();

        // Completing the target drops the source atomically
        let completed = view.start_shard(&target).unwrap();
        assert!(completed.is_started());
        assert!(view.shard_on_node(&shard_id, "node-1").is_none());
        assert!(completed.allocation_id.as_ref().unwrap().relocation_id.is_none());
        view.validate(&metadata).unwrap();
    }

    #[test]
    fn test_cancel_relocation_restores_source() {
        let (mut view, metadata, shard_id) = make_view(0, &["node-1", "node-2"]);
        let started = start_primary(&mut view, "node-1");

        view.relocate(&started, "node-2", -1).unwrap();
        let source = view.shard_on_node(&shard_id, "node-1").unwrap().clone();
        view.cancel_relocation(&source).unwrap();

        let restored = view.shard_on_node(&shard_id, "node-1").unwrap();
        assert!(restored.is_started());
        assert!(restored.relocating_node.is_none());
        assert!(view.shard_on_node(&shard_id, "node-2").is_none());
        view.validate(&metadata).unwrap();
    }

    #[test]
    fn test_fail_relocation_target_restores_source() {
        let (mut view, metadata, shard_id) = make_view(0, &["node-1", "node-2"]);
        let started = start_primary(&mut view, "node-1");

        view.relocate(&started, "node-2", -1).unwrap();
        let target = view.shard_on_node(&shard_id, "node-2").unwrap().clone();
        view.fail_shard(&target, info()).unwrap();

        assert!(view.shard_on_node(&shard_id, "node-1").unwrap().is_started());
        assert!(view.shard_on_node(&shard_id, "node-2").is_none());
        assert!(view.unassigned().is_empty());
        view.validate(&metadata).unwrap();
    }

    #[test]
    fn test_fail_started_primary_promotes_replica() {
        let (mut view, metadata, shard_id) = make_view(1, &["node-1", "node-2"]);
        let primary = start_primary(&mut view, "node-1");
        start_replica(&mut view, "node-2");

        view.fail_shard(&primary, info()).unwrap();

        let promoted = view.shard_on_node(&shard_id, "node-2").unwrap();
        assert!(promoted.primary);
        assert!(promoted.is_started());

        let demoted = view.unassigned().iter_all().next().unwrap();
        assert!(!demoted.primary);
        let demoted_info = demoted.unassigned_info.as_ref().unwrap();
        assert_eq!(demoted_info.reason, UnassignedReason::PrimaryFailed);
        view.validate(&metadata).unwrap();
    }

    #[test]
    fn test_fail_last_copy_keeps_primary_flag() {
        let (mut view, metadata, _) = make_view(0, &["node-1"]);
        let primary = start_primary(&mut view, "node-1");

        view.fail_shard(&primary, info().with_failed_allocations(1)).unwrap();

        let queued = view.unassigned().iter_all().next().unwrap();
        assert!(queued.primary);
        let queued_info = queued.unassigned_info.as_ref().unwrap();
        assert_eq!(queued_info.reason, UnassignedReason::AllocationFailed);
        assert_eq!(queued_info.failed_allocations, 1);
        view.validate(&metadata).unwrap();
    }

    #[test]
    fn test_fail_primary_cascades_to_initializing_replica() {
        let (mut view, metadata, shard_id) = make_view(1, &["node-1", "node-2"]);
        let primary = start_primary(&mut view, "node-1");

        let replica = view.unassigned_mut().remove_first(|s| !s.primary).unwrap();
        view.initialize(replica, "node-2", None, -1).unwrap();

        view.fail_shard(&primary, info()).unwrap();

        // No promotable replica existed; the primary keeps its flag and the
        // initializing replica is back in the queue with PRIMARY_FAILED.
        assert!(view.shard_on_node(&shard_id, "node-2").is_none());
        let reasons: Vec<_> = view
            .unassigned()
            .iter_all()
            .map(|s| s.unassigned_info.as_ref().unwrap().reason)
            .collect();
        assert!(reasons.contains(&UnassignedReason::PrimaryFailed));
        assert!(reasons.contains(&UnassignedReason::AllocationFailed));
        view.validate(&metadata).unwrap();
    }

    #[test]
    fn test_stale_failure_reference_is_noop() {
        let (mut view, _, _) = make_view(0, &["node-1"]);
        let primary = start_primary(&mut view, "node-1");

        view.fail_shard(&primary, info()).unwrap();
        // Second failure of the same routing refers to a removed copy
        view.fail_shard(&primary, info()).unwrap();
        assert_eq!(view.unassigned().len(), 1);
    }

    #[test]
    fn test_roundtrip_to_routing_table() {
        let (mut view, metadata, _) = make_view(1, &["node-1", "node-2"]);
        start_primary(&mut view, "node-1");

        let table = view.to_routing_table(7, &metadata);
        assert_eq!(table.version, 7);
        assert_eq!(table.all_shards().count(), 2);
        table.validate(&metadata).unwrap();

        // Rebuilding a view from the produced table is stable
        let discovery = DiscoveryNodes::new([
            DiscoveryNode::new("node-1"),
            DiscoveryNode::new("node-2"),
        ]);
        let second = RoutingNodes::from_state(&table, &discovery);
        assert_eq!(second.to_routing_table(7, &metadata), table);
    }
}
