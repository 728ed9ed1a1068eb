//! Immutable routing tables
//!
//! A routing table is the assignment half of a cluster state snapshot: every
//! copy of every shard of every index, including the unassigned ones. Tables
//! are values; a reroute pass builds a new one from its working view and the
//! previous table is never touched.

use super::shard::{ShardId, ShardRouting};
use super::unassigned::{UnassignedInfo, UnassignedReason};
use crate::cluster::{Index, IndexMetadata, Metadata};
use crate::error::{AllocationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// All copies of one shard group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRoutingTable {
    pub shard_id: ShardId,
    shards: Vec<ShardRouting>,
}

impl ShardRoutingTable {
    pub fn new(shard_id: ShardId, mut shards: Vec<ShardRouting>) -> Self {
        sort_canonical(&mut shards);
        Self { shard_id, shards }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// The primary copy. During a primary relocation this is the relocating
    /// source; the initializing target is reachable through the pairing.
    pub fn primary(&self) -> Option<&ShardRouting> {
        self.shards
            .iter()
            .find(|s| s.primary && !s.is_relocation_target())
    }

    /// Replica copies, excluding relocation targets
    pub fn replicas(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards
            .iter()
            .filter(|s| !s.primary && !s.is_relocation_target())
    }

    /// Copies counted against the configured copy count: everything except
    /// the transient target halves of relocations
    pub fn logical_copies(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| !s.is_relocation_target())
    }

    pub fn unassigned(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.is_unassigned())
    }

    pub fn active_count(&self) -> usize {
        self.shards.iter().filter(|s| s.is_active()).count()
    }
}

/// Stable copy ordering so structurally equal tables compare equal
fn sort_canonical(shards: &mut [ShardRouting]) {
    shards.sort_by(|a, b| {
        let key = |s: &ShardRouting| {
            (
                !s.primary,
                s.current_node.is_none(),
                s.current_node.clone().unwrap_or_default(),
                s.allocation_id_str().unwrap_or_default().to_string(),
                s.unassigned_info
                    .as_ref()
                    .map(|i| i.unassigned_since_nanos)
                    .unwrap_or(0),
            )
        };
        key(a).cmp(&key(b))
    });
}

/// Routing of every shard of one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    pub index: Index,
    shards: BTreeMap<u32, ShardRoutingTable>,
}

impl IndexRoutingTable {
    pub fn new(index: Index, shards: BTreeMap<u32, ShardRoutingTable>) -> Self {
        Self { index, shards }
    }

    pub fn shard(&self, shard_number: u32) -> Option<&ShardRoutingTable> {
        self.shards.get(&shard_number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShardRoutingTable> {
        self.shards.values()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }
}

/// The whole cluster's shard routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RoutingTable {
    /// Version of this table; the pass preserves it, callers bump it when
    /// publishing a new cluster state.
    pub version: u64,

    indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTable {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            indices: BTreeMap::new(),
        }
    }

    pub fn from_indices(
        version: u64,
        indices: impl IntoIterator<Item = IndexRoutingTable>,
    ) -> Self {
        Self {
            version,
            indices: indices
                .into_iter()
                .map(|t| (t.index.name.clone(), t))
                .collect(),
        }
    }

    pub fn index(&self, name: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexRoutingTable> {
        self.indices.values()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn shard_group(&self, shard_id: &ShardId) -> Option<&ShardRoutingTable> {
        self.indices
            .get(shard_id.index_name())
            .and_then(|index| index.shard(shard_id.id))
    }

    /// Primary copy of a shard group
    pub fn primary(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.shard_group(shard_id).and_then(|group| group.primary())
    }

    /// Every copy in the table, in deterministic order
    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.indices
            .values()
            .flat_map(|index| index.iter())
            .flat_map(|group| group.iter())
    }

    /// Copies assigned to a given node
    pub fn shards_on_node<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ShardRouting> {
        self.all_shards()
            .filter(move |s| s.current_node.as_deref() == Some(node_id))
    }

    /// Add an index whose shards have never existed: every copy starts
    /// unassigned with reason `INDEX_CREATED`.
    pub fn add_index_as_new(&mut self, meta: &IndexMetadata, now_nanos: i64, now_millis: i64) {
        self.add_index_unassigned(meta, UnassignedReason::IndexCreated, now_nanos, now_millis);
    }

    /// Add an index recovered from persistent state after a full-cluster
    /// restart: copies are unassigned with reason `CLUSTER_RECOVERED` and the
    /// gateway allocator will look for their on-disk data.
    pub fn add_index_as_recovered(&mut self, meta: &IndexMetadata, now_nanos: i64, now_millis: i64) {
        self.add_index_unassigned(meta, UnassignedReason::ClusterRecovered, now_nanos, now_millis);
    }

    fn add_index_unassigned(
        &mut self,
        meta: &IndexMetadata,
        reason: UnassignedReason,
        now_nanos: i64,
        now_millis: i64,
    ) {
        let mut shards = BTreeMap::new();
        for number in 0..meta.number_of_shards {
            let shard_id = ShardId::new(meta.index.clone(), number);
            let mut copies = Vec::with_capacity(meta.total_copies() as usize);
            copies.push(ShardRouting::new_unassigned(
                shard_id.clone(),
                true,
                UnassignedInfo::new(reason, now_nanos, now_millis),
            ));
            for _ in 0..meta.number_of_replicas {
                copies.push(ShardRouting::new_unassigned(
                    shard_id.clone(),
                    false,
                    UnassignedInfo::new(reason, now_nanos, now_millis),
                ));
            }
            shards.insert(number, ShardRoutingTable::new(shard_id, copies));
        }
        self.indices.insert(
            meta.index.name.clone(),
            IndexRoutingTable::new(meta.index.clone(), shards),
        );
    }

    /// Add unassigned replicas to an existing index after its replica count
    /// was raised. `added` copies per shard group, reason `REPLICA_ADDED`.
    pub fn add_replicas(
        &mut self,
        index_name: &str,
        added: u32,
        now_nanos: i64,
        now_millis: i64,
    ) -> Result<()> {
        let table = self
            .indices
            .get(index_name)
            .ok_or_else(|| AllocationError::UnknownIndex(index_name.to_string()))?;

        let mut shards = BTreeMap::new();
        for group in table.iter() {
            let mut copies: Vec<ShardRouting> = group.iter().cloned().collect();
            for _ in 0..added {
                copies.push(ShardRouting::new_unassigned(
                    group.shard_id.clone(),
                    false,
                    UnassignedInfo::new(UnassignedReason::ReplicaAdded, now_nanos, now_millis),
                ));
            }
            shards.insert(
                group.shard_id.id,
                ShardRoutingTable::new(group.shard_id.clone(), copies),
            );
        }
        let index = table.index.clone();
        self.indices
            .insert(index_name.to_string(), IndexRoutingTable::new(index, shards));
        Ok(())
    }

    /// Check the table against metadata: indices line up, every shard group
    /// exists with the configured copy count, exactly one primary per group,
    /// and allocation ids are unique within a group.
    pub fn validate(&self, metadata: &Metadata) -> Result<()> {
        for meta in metadata.iter() {
            let table = self.index(&meta.index.name).ok_or_else(|| {
                AllocationError::InvariantViolation(format!(
                    "index {} has metadata but no routing",
                    meta.index.name
                ))
            })?;
            if table.index != meta.index {
                return Err(AllocationError::InvariantViolation(format!(
                    "index {} routing carries a different uuid than its metadata",
                    meta.index.name
                )));
            }
            if table.len() != meta.number_of_shards as usize {
                return Err(AllocationError::InvariantViolation(format!(
                    "index {} has {} shard groups, metadata says {}",
                    meta.index.name,
                    table.len(),
                    meta.number_of_shards
                )));
            }
            for group in table.iter() {
                let copies = group.logical_copies().count();
                if copies != meta.total_copies() as usize {
                    return Err(AllocationError::InvariantViolation(format!(
                        "shard {} has {} copies, metadata says {}",
                        group.shard_id,
                        copies,
                        meta.total_copies()
                    )));
                }
                let primaries = group.logical_copies().filter(|s| s.primary).count();
                if primaries != 1 {
                    return Err(AllocationError::InvariantViolation(format!(
                        "shard {} has {} primaries",
                        group.shard_id, primaries
                    )));
                }
                let mut seen = BTreeSet::new();
                for shard in group.iter() {
                    if let Some(id) = shard.allocation_id_str() {
                        if !seen.insert(id.to_string()) {
                            return Err(AllocationError::InvariantViolation(format!(
                                "shard {} has duplicate allocation id {}",
                                group.shard_id, id
                            )));
                        }
                    }
                }
            }
        }
        for table in self.iter() {
            if metadata.index(&table.index.name).is_none() {
                return Err(AllocationError::InvariantViolation(format!(
                    "index {} has routing but no metadata",
                    table.index.name
                )));
            }
        }
        Ok(())
    }
}
