//! The allocation service: public entry points and the commit protocol
//!
//! Stateless façade over the decider stack, the gateway allocator and the
//! balancer. Every operation consumes an immutable `ClusterState`, applies an
//! event batch to a private working copy, runs a reroute pass, and returns
//! either the inputs untouched (`changed = false`, same object identities) or
//! a fully validated replacement table and metadata.
//!
//! Callers serialize invocations; a pass is synchronous, CPU-bound and owns
//! its working copy exclusively.

use crate::allocation::commands::{execute_commands, AllocationCommand};
use crate::allocation::context::RoutingAllocation;
use crate::allocation::explain::RoutingExplanations;
use crate::allocation::reconcile::reconcile;
use crate::allocator::{BalancedShardsAllocator, ShardsAllocator};
use crate::cluster::{ClusterHealth, ClusterState, HealthChange, Metadata};
use crate::deciders::AllocationDeciders;
use crate::error::{AllocationError, Result};
use crate::gateway::{EmptyStoreOracle, GatewayAllocator};
use crate::info::{ClusterInfoSource, EmptyClusterInfo};
use crate::routing::{RoutingTable, ShardId, ShardRouting, UnassignedInfo, UnassignedReason};
use crate::settings::AllocationSettings;
use crate::time::{Clock, SystemClock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A shard copy reported as failed, with the failure detail
#[derive(Debug, Clone)]
pub struct FailedShard {
    pub routing: ShardRouting,
    pub message: String,
}

impl FailedShard {
    pub fn new(routing: ShardRouting, message: &str) -> Self {
        Self {
            routing,
            message: message.to_string(),
        }
    }
}

/// Outcome of one allocation operation
#[derive(Debug, Clone)]
pub struct RerouteResult {
    /// Whether the routing table or metadata changed. When false, the table
    /// and metadata are the input objects themselves.
    pub changed: bool,

    pub routing_table: Arc<RoutingTable>,
    pub metadata: Arc<Metadata>,

    /// Recorded decider trails (commands always, reroutes in explain mode)
    pub explanations: RoutingExplanations,

    /// Present when the commit moved the cluster health status
    pub health_change: Option<HealthChange>,
}

/// Orchestrates reroute passes over cluster state snapshots
pub struct AllocationService {
    settings: AllocationSettings,
    deciders: AllocationDeciders,
    gateway: GatewayAllocator,
    allocator: Box<dyn ShardsAllocator>,
    info_source: Arc<dyn ClusterInfoSource>,
    clock: Arc<dyn Clock>,
    /// Rotation counter for the unassigned queue shuffle
    rotation: AtomicU64,
}

impl AllocationService {
    /// Service with the standard decider stack, the balanced allocator, and
    /// empty resource/store oracles.
    pub fn new(settings: AllocationSettings) -> Self {
        Self {
            settings,
            deciders: AllocationDeciders::standard(),
            gateway: GatewayAllocator::new(Arc::new(EmptyStoreOracle)),
            allocator: Box::new(BalancedShardsAllocator),
            info_source: Arc::new(EmptyClusterInfo),
            clock: Arc::new(SystemClock),
            rotation: AtomicU64::new(0),
        }
    }

    /// Builder-style: replace the decider stack
    pub fn with_deciders(mut self, deciders: AllocationDeciders) -> Self {
        self.deciders = deciders;
        self
    }

    /// Builder-style: replace the gateway allocator
    pub fn with_gateway(mut self, gateway: GatewayAllocator) -> Self {
        self.gateway = gateway;
        self
    }

    /// Builder-style: replace the balancing strategy
    pub fn with_allocator(mut self, allocator: Box<dyn ShardsAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Builder-style: replace the cluster info source
    pub fn with_info_source(mut self, source: Arc<dyn ClusterInfoSource>) -> Self {
        self.info_source = source;
        self
    }

    /// Builder-style: replace the clock (tests advance a manual clock)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // ========================================
    // Entry points
    // ========================================

    /// Mark initializing shards as started. Completed relocation targets
    /// atomically drop their sources. The gateway allocator is notified even
    /// when `with_reroute` is false.
    pub fn apply_started_shards(
        &self,
        state: &ClusterState,
        started: &[ShardRouting],
        with_reroute: bool,
    ) -> Result<RerouteResult> {
        if started.is_empty() {
            return Ok(Self::unchanged(state));
        }
        let timer = Instant::now();
        let mut allocation = self.new_context(state);

        let mut seen: BTreeSet<(ShardId, String)> = BTreeSet::new();
        for routing in started {
            let key = Self::batch_key(routing, "started")?;
            if !seen.insert(key) {
                return Err(AllocationError::InvalidInput(format!(
                    "duplicate started entry for {}",
                    routing.describe()
                )));
            }
            let exists = routing.current_node.as_deref().is_some_and(|node| {
                allocation
                    .routing_nodes()
                    .shard_on_node(&routing.shard_id, node)
                    .is_some_and(|c| c.is_same_allocation(routing) && c.is_initializing())
            });
            if !exists {
                return Err(AllocationError::InvalidInput(format!(
                    "started entry {} does not match an initializing shard",
                    routing.describe()
                )));
            }
        }

        for routing in started {
            let shard = allocation.routing_nodes_mut().start_shard(routing)?;
            debug!(shard = %shard.describe(), "shard started");
        }

        let shard_ids: Vec<ShardId> = started.iter().map(|s| s.shard_id.clone()).collect();
        self.gateway.apply_started_shards(&shard_ids);

        if with_reroute {
            self.reroute_pass(&mut allocation, false);
        }
        self.commit(state, allocation, "shards_started", timer)
    }

    /// Fail shard copies: each moves back to the unassigned queue with its
    /// failure counter bumped, and its node is ignored for the rest of the
    /// pass so the balancer cannot put it straight back. Always reroutes.
    pub fn apply_failed_shards(
        &self,
        state: &ClusterState,
        failed: &[FailedShard],
    ) -> Result<RerouteResult> {
        if failed.is_empty() {
            return Ok(Self::unchanged(state));
        }
        let timer = Instant::now();
        let mut allocation = self.new_context(state);

        let mut seen: BTreeSet<(ShardId, String)> = BTreeSet::new();
        for failure in failed {
            let routing = &failure.routing;
            let key = Self::batch_key(routing, "failed")?;
            if !seen.insert(key) {
                return Err(AllocationError::InvalidInput(format!(
                    "duplicate failed entry for {}",
                    routing.describe()
                )));
            }
            let exists = routing.current_node.as_deref().is_some_and(|node| {
                allocation
                    .routing_nodes()
                    .shard_on_node(&routing.shard_id, node)
                    .is_some_and(|c| c.is_same_allocation(routing))
            });
            if !exists {
                return Err(AllocationError::InvalidInput(format!(
                    "failed entry {} does not match an assigned shard",
                    routing.describe()
                )));
            }
        }

        for failure in failed {
            let routing = &failure.routing;
            let Some(node_id) = routing.current_node.clone() else {
                continue;
            };
            // A cascade from an earlier entry in this batch may already have
            // removed the copy; fail_shard treats that as a no-op.
            let prior_failures = allocation
                .routing_nodes()
                .shard_on_node(&routing.shard_id, &node_id)
                .and_then(|c| c.unassigned_info.as_ref())
                .map(|i| i.failed_allocations)
                .unwrap_or(0);
            let unassigned_info = UnassignedInfo::new(
                UnassignedReason::AllocationFailed,
                allocation.current_nanos(),
                allocation.current_millis(),
            )
            .with_message(&failure.message)
            .with_failed_allocations(prior_failures + 1);

            warn!(shard = %routing.describe(), message = %failure.message, "failing shard");
            allocation
                .routing_nodes_mut()
                .fail_shard(routing, unassigned_info)?;
            allocation.add_ignored(&node_id, routing.shard_id.clone());
        }

        let shard_ids: Vec<ShardId> = failed.iter().map(|f| f.routing.shard_id.clone()).collect();
        self.gateway.apply_failed_shards(&shard_ids);

        self.reroute_pass(&mut allocation, false);
        self.commit(state, allocation, "shards_failed", timer)
    }

    /// Fail every shard held by a node that is no longer in the live data
    /// node set, honoring per-index node-left delays, and drop the node from
    /// the routing view.
    pub fn deassociate_dead_nodes(
        &self,
        state: &ClusterState,
        reroute: bool,
        reason: &str,
    ) -> Result<RerouteResult> {
        let timer = Instant::now();
        let mut allocation = self.new_context(state);

        let dead: Vec<String> = allocation
            .routing_nodes()
            .node_ids()
            .into_iter()
            .filter(|node_id| {
                !allocation
                    .nodes()
                    .get(node_id)
                    .map(|n| n.is_data_node())
                    .unwrap_or(false)
            })
            .collect();

        for node_id in &dead {
            let shards: Vec<ShardRouting> = allocation
                .routing_nodes()
                .node(node_id)
                .map(|n| n.shards().cloned().collect())
                .unwrap_or_default();
            if !shards.is_empty() {
                info!(node = %node_id, shards = shards.len(), reason, "deassociating dead node");
            }
            for shard in shards {
                let timeout = allocation
                    .metadata()
                    .index(shard.shard_id.index_name())
                    .map(|m| m.delayed_node_left_timeout_millis)
                    .unwrap_or(0);
                let unassigned_info = UnassignedInfo::new(
                    UnassignedReason::NodeLeft,
                    allocation.current_nanos(),
                    allocation.current_millis(),
                )
                .with_message(&format!("node left: {}", reason))
                .with_delayed(timeout > 0);
                allocation.routing_nodes_mut().fail_shard(&shard, unassigned_info)?;
            }
            allocation.routing_nodes_mut().remove_node(node_id)?;
        }

        if reroute {
            self.reroute_pass(&mut allocation, false);
        }
        self.commit(state, allocation, "deassociate_dead_nodes", timer)
    }

    /// Plain reroute triggered by a settings change or a periodic tick
    pub fn reroute(&self, state: &ClusterState, reason: &str) -> Result<RerouteResult> {
        let timer = Instant::now();
        let mut allocation = self.new_context(state);
        self.reroute_pass(&mut allocation, false);
        self.commit(state, allocation, reason, timer)
    }

    /// Reroute with every decider verdict recorded, for the explain surface
    pub fn explain_reroute(&self, state: &ClusterState, reason: &str) -> Result<RerouteResult> {
        let timer = Instant::now();
        let mut allocation = self.new_context(state);
        allocation.set_debug_decision(true);
        self.reroute_pass(&mut allocation, false);
        self.commit(state, allocation, reason, timer)
    }

    /// Reroute with administrative commands. The command batch is atomic and
    /// deterministic: the unassigned queue is not shuffled and deciders run in
    /// debug mode so every verdict is recorded.
    pub fn reroute_with_commands(
        &self,
        state: &ClusterState,
        commands: &[AllocationCommand],
        explain: bool,
        retry_failed: bool,
    ) -> Result<RerouteResult> {
        let timer = Instant::now();
        let mut allocation = self.new_context(state);
        allocation.set_debug_decision(true);
        allocation.set_retry_failed(retry_failed);

        execute_commands(&mut allocation, commands, &self.gateway)?;

        allocation.set_debug_decision(explain);
        self.reroute_pass(&mut allocation, true);
        self.commit(state, allocation, "reroute_commands", timer)
    }

    /// Nanoseconds until the next delayed shard becomes allocatable; `None`
    /// when nothing is delay-held. Zero means a reroute is already due.
    pub fn next_delay_nanos(&self, state: &ClusterState) -> Option<i64> {
        let now = self.clock.now_nanos();
        state
            .routing_table
            .all_shards()
            .filter(|s| s.is_unassigned())
            .filter_map(|s| {
                let shard_info = s.unassigned_info.as_ref()?;
                if !shard_info.delayed {
                    return None;
                }
                let timeout = state
                    .metadata
                    .index(s.shard_id.index_name())
                    .map(|m| m.delayed_node_left_timeout_millis)
                    .unwrap_or(0);
                Some(shard_info.remaining_delay_nanos(now, timeout))
            })
            .min()
    }

    // ========================================
    // Pass internals
    // ========================================

    fn new_context<'a>(&'a self, state: &'a ClusterState) -> RoutingAllocation<'a> {
        RoutingAllocation::new(
            &self.deciders,
            state,
            &self.settings,
            self.info_source.latest(),
            self.clock.now_nanos(),
            self.clock.now_millis(),
        )
    }

    /// One reroute: expire delay markers, shuffle (outside command mode), let
    /// the gateway place data-bearing shards, then run the balancer.
    fn reroute_pass(&self, allocation: &mut RoutingAllocation<'_>, command_mode: bool) {
        self.remove_delay_markers(allocation);
        if !command_mode {
            let rotation = self.rotation.fetch_add(1, Ordering::Relaxed) as usize;
            allocation.routing_nodes_mut().unassigned_mut().rotate(rotation);
        }
        self.gateway.allocate_unassigned(allocation);
        self.allocator.allocate(allocation);
        allocation.routing_nodes_mut().unassigned_mut().resolve_ignored();
    }

    /// Clear the delay flag on unassigned shards whose node-left timeout has
    /// fully elapsed at this pass's clock.
    fn remove_delay_markers(&self, allocation: &mut RoutingAllocation<'_>) {
        let now = allocation.current_nanos();
        let timeouts: std::collections::BTreeMap<String, u64> = allocation
            .metadata()
            .iter()
            .map(|m| (m.index.name.clone(), m.delayed_node_left_timeout_millis))
            .collect();
        allocation
            .routing_nodes_mut()
            .unassigned_mut()
            .update_info(|shard| {
                if let Some(shard_info) = shard.unassigned_info.as_mut() {
                    if shard_info.delayed {
                        let timeout = timeouts
                            .get(shard.shard_id.index_name())
                            .copied()
                            .unwrap_or(0);
                        if shard_info.remaining_delay_nanos(now, timeout) == 0 {
                            shard_info.delayed = false;
                        }
                    }
                }
            });
    }

    /// Build the result: rebuild the table, short-circuit when nothing
    /// changed, otherwise reconcile metadata, validate, and report the health
    /// delta.
    fn commit(
        &self,
        state: &ClusterState,
        mut allocation: RoutingAllocation<'_>,
        reason: &str,
        timer: Instant,
    ) -> Result<RerouteResult> {
        let explanations = allocation.take_explanations();
        let new_table = allocation
            .routing_nodes()
            .to_routing_table(state.routing_table.version, &state.metadata);

        if new_table == *state.routing_table {
            crate::metrics::record_reroute_duration(reason, timer.elapsed());
            crate::metrics::record_reroute_result(reason, false);
            return Ok(RerouteResult {
                changed: false,
                routing_table: Arc::clone(&state.routing_table),
                metadata: Arc::clone(&state.metadata),
                explanations,
                health_change: None,
            });
        }

        allocation.routing_nodes().validate(&state.metadata)?;
        let new_metadata = reconcile(&state.metadata, &state.routing_table, &new_table)?;
        new_table.validate(&new_metadata)?;

        let before = ClusterHealth::from_table(&state.routing_table);
        let after = ClusterHealth::from_table(&new_table);
        crate::metrics::update_shard_gauges(&after);
        let health_change = if before.status != after.status {
            info!(
                from = before.status.as_str(),
                to = after.status.as_str(),
                reason,
                "cluster health changed"
            );
            crate::metrics::record_health_change(before.status, after.status);
            Some(HealthChange {
                from: before.status,
                to: after.status,
                reason: reason.to_string(),
            })
        } else {
            None
        };

        crate::metrics::record_reroute_duration(reason, timer.elapsed());
        crate::metrics::record_reroute_result(reason, true);

        Ok(RerouteResult {
            changed: true,
            routing_table: Arc::new(new_table),
            metadata: new_metadata,
            explanations,
            health_change,
        })
    }

    fn unchanged(state: &ClusterState) -> RerouteResult {
        RerouteResult {
            changed: false,
            routing_table: Arc::clone(&state.routing_table),
            metadata: Arc::clone(&state.metadata),
            explanations: RoutingExplanations::new(),
            health_change: None,
        }
    }

    fn batch_key(routing: &ShardRouting, kind: &str) -> Result<(ShardId, String)> {
        let allocation_id = routing.allocation_id_str().ok_or_else(|| {
            AllocationError::InvalidInput(format!(
                "{} entry {} carries no allocation id",
                kind,
                routing.describe()
            ))
        })?;
        Ok((routing.shard_id.clone(), allocation_id.to_string()))
    }
}
