//! Weight-based shard placement and rebalancing
//!
//! Node weight combines the node's total shard count and its count for the
//! index being placed, each relative to the cluster average. Lower weight
//! wins; ties break on node id so placement is deterministic.

use super::ShardsAllocator;
use crate::allocation::RoutingAllocation;
use crate::deciders::{DeciderDecision, Decision};
use crate::routing::{AllocationStatus, RoutingNode, ShardRouting};
use tracing::{debug, info, warn};

/// The default balancer
pub struct BalancedShardsAllocator;

enum PlacementOutcome {
    Assign {
        node_id: String,
        decisions: Vec<DeciderDecision>,
    },
    Throttled(Vec<DeciderDecision>),
    Refused(Vec<DeciderDecision>),
}

impl ShardsAllocator for BalancedShardsAllocator {
    fn allocate(&self, allocation: &mut RoutingAllocation<'_>) -> bool {
        let mut changed = self.allocate_unassigned(allocation);
        changed |= self.move_shards(allocation);
        changed |= self.rebalance(allocation);
        changed
    }
}

impl BalancedShardsAllocator {
    /// Place unassigned shards: primaries first, then replicas, each on the
    /// lowest-weight node the deciders accept.
    fn allocate_unassigned(&self, allocation: &mut RoutingAllocation<'_>) -> bool {
        let mut changed = false;
        let mut pending = allocation.routing_nodes_mut().unassigned_mut().drain_queue();
        // Primaries first; queue order is preserved within each class
        pending.sort_by_key(|s| !s.primary);

        for shard in pending {
            let delayed = shard
                .unassigned_info
                .as_ref()
                .map(|i| i.delayed)
                .unwrap_or(false);
            if delayed {
                allocation
                    .routing_nodes_mut()
                    .unassigned_mut()
                    .ignore(shard, AllocationStatus::DelayedAllocation);
                continue;
            }

            match self.decide_placement(&shard, allocation) {
                PlacementOutcome::Assign { node_id, decisions } => {
                    if allocation.debug_decision() {
                        allocation
                            .explanations_mut()
                            .push(format!("allocate {}", shard.describe()), decisions);
                    }
                    let size = allocation
                        .info()
                        .shard_size_or(&shard.shard_id, ShardRouting::UNKNOWN_EXPECTED_SIZE);
                    let fallback = shard.clone();
                    match allocation
                        .routing_nodes_mut()
                        .initialize(shard, &node_id, None, size)
                    {
                        Ok(initialized) => {
                            debug!(shard = %initialized.describe(), "allocated unassigned shard");
                            changed = true;
                        }
                        Err(err) => {
                            warn!(%err, shard = %fallback.describe(), "placement failed");
                            allocation.routing_nodes_mut().unassigned_mut().push_back(fallback);
                        }
                    }
                }
                PlacementOutcome::Throttled(decisions) => {
                    allocation
                        .explanations_mut()
                        .push(format!("allocate {}", shard.describe()), decisions);
                    allocation
                        .routing_nodes_mut()
                        .unassigned_mut()
                        .ignore(shard, AllocationStatus::Throttled);
                }
                PlacementOutcome::Refused(decisions) => {
                    allocation
                        .explanations_mut()
                        .push(format!("allocate {}", shard.describe()), decisions);
                    allocation
                        .routing_nodes_mut()
                        .unassigned_mut()
                        .ignore(shard, AllocationStatus::DecidersNo);
                }
            }
        }
        changed
    }

    /// Evaluate every live node for one shard
    fn decide_placement(
        &self,
        shard: &ShardRouting,
        allocation: &RoutingAllocation<'_>,
    ) -> PlacementOutcome {
        let deciders = allocation.deciders();
        let mut best: Option<(f32, String)> = None;
        let mut throttled = false;
        let mut decisions = Vec::new();

        for node_id in allocation.routing_nodes().node_ids() {
            // Departed nodes still holding shards are not placement targets
            if !allocation.nodes().contains(&node_id) {
                continue;
            }
            let Some(node) = allocation.routing_nodes().node(&node_id) else {
                continue;
            };
            let aggregate = deciders.can_allocate(shard, node, allocation);
            decisions.extend(aggregate.decisions);
            match aggregate.decision {
                Decision::Yes => {
                    let weight = self.weight(allocation, node, shard.shard_id.index_name());
                    let better = match &best {
                        None => true,
                        Some((best_weight, best_node)) => {
                            weight < *best_weight
                                || (weight == *best_weight && node_id < *best_node)
                        }
                    };
                    if better {
                        best = Some((weight, node_id));
                    }
                }
                Decision::Throttle => throttled = true,
                Decision::No => {}
            }
        }

        match best {
            Some((_, node_id)) => PlacementOutcome::Assign { node_id, decisions },
            None if throttled => PlacementOutcome::Throttled(decisions),
            None => PlacementOutcome::Refused(decisions),
        }
    }

    /// Relocate started shards that are no longer allowed to stay where they
    /// are (filters tightened, disk filled past the high watermark).
    fn move_shards(&self, allocation: &mut RoutingAllocation<'_>) -> bool {
        let mut changed = false;
        let started: Vec<ShardRouting> = allocation
            .routing_nodes()
            .assigned_iter()
            .filter(|s| s.is_started())
            .cloned()
            .collect();

        for shard in started {
            let Some(node_id) = shard.current_node.clone() else {
                continue;
            };
            // Shards on departed nodes are handled by deassociation, not moves
            if !allocation.nodes().contains(&node_id) {
                continue;
            }
            let Some(node) = allocation.routing_nodes().node(&node_id) else {
                continue;
            };
            let remain = allocation.deciders().can_remain(&shard, node, allocation);
            if remain.decision != Decision::No {
                continue;
            }
            if allocation.debug_decision() {
                allocation
                    .explanations_mut()
                    .push(format!("move required for {}", shard.describe()), remain.decisions);
            }

            match self.decide_placement(&shard, allocation) {
                PlacementOutcome::Assign { node_id: target, .. } => {
                    let size = allocation
                        .info()
                        .shard_size_or(&shard.shard_id, shard.expected_size_bytes);
                    match allocation.routing_nodes_mut().relocate(&shard, &target, size) {
                        Ok(()) => {
                            info!(
                                shard = %shard.shard_id,
                                from = %node_id,
                                to = %target,
                                "moving shard off a node it may not remain on"
                            );
                            changed = true;
                        }
                        Err(err) => warn!(%err, shard = %shard.describe(), "move failed"),
                    }
                }
                _ => {
                    debug!(
                        shard = %shard.describe(),
                        "shard must move but no node accepts it"
                    );
                }
            }
        }
        changed
    }

    /// Move shards from the heaviest to the lightest node while the weight
    /// difference stays above the configured threshold.
    fn rebalance(&self, allocation: &mut RoutingAllocation<'_>) -> bool {
        let threshold = allocation.settings().balance.threshold;
        let mut changed = false;
        let max_moves = allocation.routing_nodes().total_assigned().max(1);

        'moves: for _ in 0..max_moves {
            let index_names: Vec<String> = allocation
                .metadata()
                .iter()
                .map(|m| m.index.name.clone())
                .collect();
            for index_name in index_names {
                if let Some((shard, target)) =
                    self.find_rebalance_move(allocation, &index_name, threshold)
                {
                    let size = allocation
                        .info()
                        .shard_size_or(&shard.shard_id, shard.expected_size_bytes);
                    match allocation.routing_nodes_mut().relocate(&shard, &target, size) {
                        Ok(()) => {
                            info!(
                                shard = %shard.shard_id,
                                to = %target,
                                "rebalancing shard"
                            );
                            changed = true;
                            continue 'moves;
                        }
                        Err(err) => {
                            warn!(%err, shard = %shard.describe(), "rebalance move failed");
                        }
                    }
                }
            }
            break;
        }
        changed
    }

    fn find_rebalance_move(
        &self,
        allocation: &RoutingAllocation<'_>,
        index_name: &str,
        threshold: f32,
    ) -> Option<(ShardRouting, String)> {
        let mut weighted: Vec<(f32, String)> = Vec::new();
        for node_id in allocation.routing_nodes().node_ids() {
            if !allocation.nodes().contains(&node_id) {
                continue;
            }
            if let Some(node) = allocation.routing_nodes().node(&node_id) {
                weighted.push((self.weight(allocation, node, index_name), node_id));
            }
        }
        if weighted.len() < 2 {
            return None;
        }
        weighted.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        let (light_weight, light_node) = weighted.first()?.clone();
        let (heavy_weight, heavy_node) = weighted.last()?.clone();
        if heavy_weight - light_weight <= threshold {
            return None;
        }

        let donor = allocation.routing_nodes().node(&heavy_node)?;
        let receiver = allocation.routing_nodes().node(&light_node)?;
        for shard in donor
            .shards()
            .filter(|s| s.is_started() && s.shard_id.index_name() == index_name)
        {
            if allocation
                .deciders()
                .can_rebalance(shard, allocation)
                .decision
                != Decision::Yes
            {
                continue;
            }
            if allocation
                .deciders()
                .can_allocate(shard, receiver, allocation)
                .decision
                == Decision::Yes
            {
                return Some((shard.clone(), light_node));
            }
        }
        None
    }

    /// Weight of a node for an index; lower attracts shards
    fn weight(
        &self,
        allocation: &RoutingAllocation<'_>,
        node: &RoutingNode,
        index_name: &str,
    ) -> f32 {
        let balance = allocation.settings().balance;
        let view = allocation.routing_nodes();
        let node_count = allocation.nodes().data_nodes().count().max(1) as f32;
        let total = view.total_assigned() as f32;
        let index_total: usize = view.nodes().map(|n| n.index_shard_count(index_name)).sum();

        balance.shard_balance * (node.shard_count() as f32 - total / node_count)
            + balance.index_balance
                * (node.index_shard_count(index_name) as f32 - index_total as f32 / node_count)
    }
}
