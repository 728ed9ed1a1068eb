//! Recovery placement for shards with existing on-disk data
//!
//! Runs before the balancer on every pass. Primaries that must recover from
//! existing data may only land on a node holding an in-sync copy; replicas
//! are opportunistically placed next to existing copy data to cut recovery
//! cost. Store information comes from an injected oracle; "not fetched yet"
//! is a normal outcome, not an error, and leaves the shard unassigned with
//! `FETCHING_SHARD_DATA`.

use crate::allocation::RoutingAllocation;
use crate::deciders::Decision;
use crate::routing::{AllocationStatus, ShardId, ShardRouting};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One on-disk copy of a shard, as reported by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCopy {
    /// Allocation id persisted with the copy; absent for pre-identity legacy data
    pub allocation_id: Option<String>,

    /// On-disk size of the copy
    pub size_bytes: i64,
}

/// Result of asking for a shard's store information
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreFetch {
    /// The asynchronous fetch has not completed yet
    Pending,
    /// Copies by node id; empty when no node holds data
    Data(BTreeMap<String, StoreCopy>),
}

/// Synchronous oracle over asynchronously gathered shard store metadata
pub trait ShardStoreOracle: Send + Sync {
    fn store_info(&self, shard_id: &ShardId) -> StoreFetch;
}

/// Oracle that knows of no on-disk data; every shard recovers fresh
#[derive(Debug, Default)]
pub struct EmptyStoreOracle;

impl ShardStoreOracle for EmptyStoreOracle {
    fn store_info(&self, _shard_id: &ShardId) -> StoreFetch {
        StoreFetch::Data(BTreeMap::new())
    }
}

/// Settable oracle used in tests and by the async fetch layer above
#[derive(Default)]
pub struct SharedStoreOracle {
    data: RwLock<BTreeMap<ShardId, StoreFetch>>,
}

impl SharedStoreOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a copy for a node; replaces a pending marker
    pub fn put_copy(&self, shard_id: ShardId, node_id: &str, copy: StoreCopy) {
        let mut data = self.data.write();
        let entry = data
            .entry(shard_id)
            .or_insert_with(|| StoreFetch::Data(BTreeMap::new()));
        if let StoreFetch::Data(copies) = entry {
            copies.insert(node_id.to_string(), copy);
        } else {
            let mut copies = BTreeMap::new();
            copies.insert(node_id.to_string(), copy);
            *entry = StoreFetch::Data(copies);
        }
    }

    /// Mark a shard's fetch as still in flight
    pub fn set_pending(&self, shard_id: ShardId) {
        self.data.write().insert(shard_id, StoreFetch::Pending);
    }
}

impl ShardStoreOracle for SharedStoreOracle {
    fn store_info(&self, shard_id: &ShardId) -> StoreFetch {
        self.data
            .read()
            .get(shard_id)
            .cloned()
            .unwrap_or_else(|| StoreFetch::Data(BTreeMap::new()))
    }
}

/// Places shards whose data already exists somewhere in the cluster
pub struct GatewayAllocator {
    oracle: Arc<dyn ShardStoreOracle>,
    /// Fetched store data, kept until the shard starts or fails
    cache: RwLock<BTreeMap<ShardId, BTreeMap<String, StoreCopy>>>,
}

impl GatewayAllocator {
    pub fn new(oracle: Arc<dyn ShardStoreOracle>) -> Self {
        Self {
            oracle,
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    /// Try to place unassigned shards near their data. Shards without
    /// recoverable data fall through to the balancer untouched.
    pub fn allocate_unassigned(&self, allocation: &mut RoutingAllocation<'_>) -> bool {
        let mut changed = false;
        let pending = allocation.routing_nodes_mut().unassigned_mut().drain_queue();

        for shard in pending {
            let delayed = shard
                .unassigned_info
                .as_ref()
                .map(|i| i.delayed)
                .unwrap_or(false);
            if delayed {
                allocation.routing_nodes_mut().unassigned_mut().push_back(shard);
                continue;
            }
            if shard.primary {
                changed |= self.allocate_primary(shard, allocation);
            } else {
                changed |= self.allocate_replica(shard, allocation);
            }
        }
        changed
    }

    /// A primary with a non-empty in-sync set must recover from one of those
    /// copies; anything else loses acknowledged writes.
    fn allocate_primary(
        &self,
        shard: ShardRouting,
        allocation: &mut RoutingAllocation<'_>,
    ) -> bool {
        let in_sync = allocation
            .metadata()
            .index(shard.shard_id.index_name())
            .and_then(|m| m.in_sync_ids(shard.shard_id.id))
            .cloned()
            .unwrap_or_default();
        if in_sync.is_empty() {
            // Fresh primary; the balancer places it anywhere
            allocation.routing_nodes_mut().unassigned_mut().push_back(shard);
            return false;
        }

        let copies = match self.known_copies(&shard.shard_id) {
            StoreFetch::Pending => {
                debug!(shard = %shard.shard_id, "store fetch in flight");
                allocation
                    .routing_nodes_mut()
                    .unassigned_mut()
                    .ignore(shard, AllocationStatus::FetchingShardData);
                return false;
            }
            StoreFetch::Data(copies) => copies,
        };

        // Nodes holding an in-sync copy, in id order
        let mut candidates: Vec<(String, String, i64)> = Vec::new();
        for (node_id, copy) in &copies {
            let Some(allocation_id) = copy.allocation_id.as_ref() else {
                continue;
            };
            if in_sync.contains(allocation_id) && allocation.nodes().contains(node_id) {
                candidates.push((node_id.clone(), allocation_id.clone(), copy.size_bytes));
            }
        }
        if candidates.is_empty() {
            debug!(shard = %shard.shard_id, "no in-sync copy left in the cluster");
            allocation
                .routing_nodes_mut()
                .unassigned_mut()
                .ignore(shard, AllocationStatus::NoValidShardCopy);
            return false;
        }

        let mut throttled = false;
        let mut chosen: Option<(String, String, i64)> = None;
        for (node_id, allocation_id, size) in candidates {
            let Some(node) = allocation.routing_nodes().node(&node_id) else {
                continue;
            };
            let decision = allocation
                .deciders()
                .can_allocate(&shard, node, allocation)
                .decision;
            match decision {
                Decision::Yes => {
                    chosen = Some((node_id, allocation_id, size));
                    break;
                }
                Decision::Throttle => throttled = true,
                Decision::No => {}
            }
        }

        match chosen {
            Some((node_id, allocation_id, size)) => {
                let result = allocation.routing_nodes_mut().initialize(
                    shard,
                    &node_id,
                    Some(&allocation_id),
                    size,
                );
                match result {
                    Ok(initialized) => {
                        debug!(
                            shard = %initialized.describe(),
                            "recovering primary from existing in-sync copy"
                        );
                        true
                    }
                    Err(_) => false,
                }
            }
            None => {
                let status = if throttled {
                    AllocationStatus::Throttled
                } else {
                    AllocationStatus::DecidersNo
                };
                allocation.routing_nodes_mut().unassigned_mut().ignore(shard, status);
                false
            }
        }
    }

    /// Replicas prefer nodes that already hold copy data; without data they
    /// fall through to the balancer.
    fn allocate_replica(
        &self,
        shard: ShardRouting,
        allocation: &mut RoutingAllocation<'_>,
    ) -> bool {
        if allocation
            .routing_nodes()
            .active_primary(&shard.shard_id)
            .is_none()
        {
            allocation.routing_nodes_mut().unassigned_mut().push_back(shard);
            return false;
        }

        let copies = match self.known_copies(&shard.shard_id) {
            StoreFetch::Pending => {
                allocation
                    .routing_nodes_mut()
                    .unassigned_mut()
                    .ignore(shard, AllocationStatus::FetchingShardData);
                return false;
            }
            StoreFetch::Data(copies) => copies,
        };

        for (node_id, copy) in &copies {
            if !allocation.nodes().contains(node_id) {
                continue;
            }
            let Some(node) = allocation.routing_nodes().node(node_id) else {
                continue;
            };
            let decision = allocation
                .deciders()
                .can_allocate(&shard, node, allocation)
                .decision;
            if decision == Decision::Yes {
                let result = allocation.routing_nodes_mut().initialize(
                    shard,
                    node_id,
                    None,
                    copy.size_bytes,
                );
                return match result {
                    Ok(initialized) => {
                        debug!(
                            shard = %initialized.describe(),
                            "placing replica next to existing copy data"
                        );
                        true
                    }
                    Err(_) => false,
                };
            }
        }

        allocation.routing_nodes_mut().unassigned_mut().push_back(shard);
        false
    }

    /// Store copies known for a shard right now, through the cache. Also
    /// consulted by the stale-primary command, which must verify its target
    /// node actually holds data.
    pub fn known_copies(&self, shard_id: &ShardId) -> StoreFetch {
        if let Some(copies) = self.cache.read().get(shard_id) {
            return StoreFetch::Data(copies.clone());
        }
        let fetched = self.oracle.store_info(shard_id);
        if let StoreFetch::Data(copies) = &fetched {
            self.cache.write().insert(shard_id.clone(), copies.clone());
        }
        fetched
    }

    /// Started shards no longer need store data; drop it
    pub fn apply_started_shards(&self, shard_ids: &[ShardId]) {
        let mut cache = self.cache.write();
        for shard_id in shard_ids {
            cache.remove(shard_id);
        }
    }

    /// Failed shards must be re-fetched; their old data may be gone
    pub fn apply_failed_shards(&self, shard_ids: &[ShardId]) {
        let mut cache = self.cache.write();
        for shard_id in shard_ids {
            cache.remove(shard_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::RoutingAllocation;
    use crate::cluster::{ClusterState, DiscoveryNode, DiscoveryNodes, IndexMetadata, Metadata};
    use crate::deciders::AllocationDeciders;
    use crate::info::ClusterInfo;
    use crate::routing::RoutingTable;
    use crate::settings::AllocationSettings;

    fn make_state_with_in_sync(in_sync_id: Option<&str>) -> ClusterState {
        let mut meta = IndexMetadata::new("logs", 1, 0);
        if let Some(id) = in_sync_id {
            meta.in_sync_allocations
                .insert(0, [id.to_string()].into_iter().collect());
        }
        let mut table = RoutingTable::new(0);
        table.add_index_as_recovered(&meta, 0, 0);
        ClusterState::new(
            "test",
            1,
            DiscoveryNodes::new([
                DiscoveryNode::new("node-1"),
                DiscoveryNode::new("node-2"),
            ]),
            Metadata::new([meta]),
            table,
        )
    }

    fn shard_id(state: &ClusterState) -> ShardId {
        state.routing_table.all_shards().next().unwrap().shard_id.clone()
    }

    #[test]
    fn test_primary_recovers_on_in_sync_node() {
        let state = make_state_with_in_sync(Some("copy-a"));
        let oracle = SharedStoreOracle::new();
        oracle.put_copy(
            shard_id(&state),
            "node-2",
            StoreCopy {
                allocation_id: Some("copy-a".to_string()),
                size_bytes: 512,
            },
        );
        let gateway = GatewayAllocator::new(oracle);

        let deciders = AllocationDeciders::standard();
        let settings = AllocationSettings::default();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, &settings, ClusterInfo::default(), 0, 0);

        assert!(gateway.allocate_unassigned(&mut allocation));

        let placed = allocation
            .routing_nodes()
            .shard_on_node(&shard_id(&state), "node-2")
            .unwrap();
        assert!(placed.is_initializing());
        assert_eq!(placed.allocation_id_str(), Some("copy-a"));
        assert_eq!(placed.expected_size_bytes, 512);
    }

    #[test]
    fn test_pending_fetch_parks_the_shard() {
        let state = make_state_with_in_sync(Some("copy-a"));
        let oracle = SharedStoreOracle::new();
        oracle.set_pending(shard_id(&state));
        let gateway = GatewayAllocator::new(oracle);

        let deciders = AllocationDeciders::standard();
        let settings = AllocationSettings::default();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, &settings, ClusterInfo::default(), 0, 0);

        assert!(!gateway.allocate_unassigned(&mut allocation));
        allocation.routing_nodes_mut().unassigned_mut().resolve_ignored();

        let queued = allocation.routing_nodes().unassigned().iter().next().unwrap();
        assert_eq!(
            queued.unassigned_info.as_ref().unwrap().last_allocation_status,
            AllocationStatus::FetchingShardData
        );
    }

    #[test]
    fn test_no_valid_copy_is_reported() {
        let state = make_state_with_in_sync(Some("copy-a"));
        // The only copy on disk is stale
        let oracle = SharedStoreOracle::new();
        oracle.put_copy(
            shard_id(&state),
            "node-1",
            StoreCopy {
                allocation_id: Some("stale-copy".to_string()),
                size_bytes: 512,
            },
        );
        let gateway = GatewayAllocator::new(oracle);

        let deciders = AllocationDeciders::standard();
        let settings = AllocationSettings::default();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, &settings, ClusterInfo::default(), 0, 0);

        gateway.allocate_unassigned(&mut allocation);
        allocation.routing_nodes_mut().unassigned_mut().resolve_ignored();

        let queued = allocation.routing_nodes().unassigned().iter().next().unwrap();
        assert_eq!(
            queued.unassigned_info.as_ref().unwrap().last_allocation_status,
            AllocationStatus::NoValidShardCopy
        );
    }

    #[test]
    fn test_fresh_primary_falls_through() {
        let state = make_state_with_in_sync(None);
        let gateway = GatewayAllocator::new(Arc::new(EmptyStoreOracle));

        let deciders = AllocationDeciders::standard();
        let settings = AllocationSettings::default();
        let mut allocation =
            RoutingAllocation::new(&deciders, &state, &settings, ClusterInfo::default(), 0, 0);

        assert!(!gateway.allocate_unassigned(&mut allocation));
        // Still queued for the balancer, no status written
        let queued = allocation.routing_nodes().unassigned().iter().next().unwrap();
        assert_eq!(
            queued.unassigned_info.as_ref().unwrap().last_allocation_status,
            AllocationStatus::NoAttempt
        );
    }

    #[test]
    fn test_cache_invalidation() {
        let state = make_state_with_in_sync(Some("copy-a"));
        let sid = shard_id(&state);
        let oracle = SharedStoreOracle::new();
        oracle.put_copy(
            sid.clone(),
            "node-1",
            StoreCopy {
                allocation_id: Some("copy-a".to_string()),
                size_bytes: 1,
            },
        );
        let gateway = GatewayAllocator::new(Arc::clone(&oracle) as Arc<dyn ShardStoreOracle>);

        assert!(matches!(gateway.known_copies(&sid), StoreFetch::Data(_)));
        assert!(gateway.cache.read().contains_key(&sid));

        gateway.apply_started_shards(std::slice::from_ref(&sid));
        assert!(!gateway.cache.read().contains_key(&sid));
    }
}
