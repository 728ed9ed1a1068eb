//! Administrative allocation commands
//!
//! Commands run against the working copy before the pass's reroute. The batch
//! is atomic: validation happens before mutation and the first rejected
//! command aborts the whole batch (the working copy is discarded, so nothing
//! leaks). Every command records its decider trail in the explanations.

use crate::allocation::context::RoutingAllocation;
use crate::deciders::Decision;
use crate::error::{AllocationError, Result};
use crate::gateway::{GatewayAllocator, StoreFetch};
use crate::routing::{ShardId, ShardRouting, ShardRoutingState, UnassignedInfo, UnassignedReason};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One administrative routing command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationCommand {
    /// Place an unassigned replica on a specific node
    AllocateReplica {
        index: String,
        shard: u32,
        node: String,
    },
    /// Force a primary from a stale copy, acknowledging data loss
    AllocateStalePrimary {
        index: String,
        shard: u32,
        node: String,
        accept_data_loss: bool,
    },
    /// Force an empty primary, discarding all known copies
    AllocateEmptyPrimary {
        index: String,
        shard: u32,
        node: String,
        accept_data_loss: bool,
    },
    /// Relocate a started shard between nodes
    Move {
        index: String,
        shard: u32,
        from_node: String,
        to_node: String,
    },
    /// Cancel an initialization or relocation
    Cancel {
        index: String,
        shard: u32,
        node: String,
        #[serde(default)]
        allow_primary: bool,
    },
}

impl AllocationCommand {
    /// Name used for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            AllocationCommand::AllocateReplica { .. } => "allocate_replica",
            AllocationCommand::AllocateStalePrimary { .. } => "allocate_stale_primary",
            AllocationCommand::AllocateEmptyPrimary { .. } => "allocate_empty_primary",
            AllocationCommand::Move { .. } => "move",
            AllocationCommand::Cancel { .. } => "cancel",
        }
    }

    /// Short description for explanations
    pub fn describe(&self) -> String {
        match self {
            AllocationCommand::AllocateReplica { index, shard, node } => {
                format!("allocate_replica {}[{}] on {}", index, shard, node)
            }
            AllocationCommand::AllocateStalePrimary { index, shard, node, .. } => {
                format!("allocate_stale_primary {}[{}] on {}", index, shard, node)
            }
            AllocationCommand::AllocateEmptyPrimary { index, shard, node, .. } => {
                format!("allocate_empty_primary {}[{}] on {}", index, shard, node)
            }
            AllocationCommand::Move {
                index,
                shard,
                from_node,
                to_node,
            } => format!("move {}[{}] {} -> {}", index, shard, from_node, to_node),
            AllocationCommand::Cancel { index, shard, node, .. } => {
                format!("cancel {}[{}] on {}", index, shard, node)
            }
        }
    }

    fn shard_id(&self, allocation: &RoutingAllocation<'_>) -> Result<ShardId> {
        let (index, shard) = match self {
            AllocationCommand::AllocateReplica { index, shard, .. }
            | AllocationCommand::AllocateStalePrimary { index, shard, .. }
            | AllocationCommand::AllocateEmptyPrimary { index, shard, .. }
            | AllocationCommand::Move { index, shard, .. }
            | AllocationCommand::Cancel { index, shard, .. } => (index, *shard),
        };
        let meta = allocation.metadata().index_required(index)?;
        if shard >= meta.number_of_shards {
            return Err(AllocationError::CommandRejected(format!(
                "{}: index {} has only {} shards",
                self.describe(),
                index,
                meta.number_of_shards
            )));
        }
        Ok(ShardId::new(meta.index.clone(), shard))
    }

    /// Execute against the working copy. Commands bypass the allocation-enable
    /// gate; all other deciders still apply.
    pub fn execute(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        gateway: &GatewayAllocator,
    ) -> Result<()> {
        let shard_id = self.shard_id(allocation)?;
        info!(command = %self.describe(), "executing allocation command");
        crate::metrics::record_command(self.name());

        match self {
            AllocationCommand::AllocateReplica { node, .. } => {
                self.execute_allocate(allocation, &shard_id, node, false, None, None)
            }
            AllocationCommand::AllocateStalePrimary {
                node,
                accept_data_loss,
                ..
            } => {
                if !accept_data_loss {
                    return Err(AllocationError::CommandRejected(format!(
                        "{}: recovering a stale copy discards newer writes and requires accept_data_loss",
                        self.describe()
                    )));
                }
                // A stale primary still recovers from data; the node must
                // actually hold a copy, and that copy keeps its identity.
                let copy = match gateway.known_copies(&shard_id) {
                    StoreFetch::Pending => {
                        return Err(AllocationError::CommandRejected(format!(
                            "{}: store information for {} is still being fetched",
                            self.describe(),
                            shard_id
                        )));
                    }
                    StoreFetch::Data(copies) => {
                        copies.get(node.as_str()).cloned().ok_or_else(|| {
                            AllocationError::CommandRejected(format!(
                                "{}: node {} holds no on-disk copy of {}",
                                self.describe(),
                                node,
                                shard_id
                            ))
                        })?
                    }
                };
                self.execute_allocate(
                    allocation,
                    &shard_id,
                    node,
                    true,
                    copy.allocation_id.as_deref(),
                    Some(copy.size_bytes),
                )
            }
            AllocationCommand::AllocateEmptyPrimary {
                node,
                accept_data_loss,
                ..
            } => {
                if !accept_data_loss {
                    return Err(AllocationError::CommandRejected(format!(
                        "{}: forcing an empty primary discards all known copies and requires accept_data_loss",
                        self.describe()
                    )));
                }
                self.execute_allocate(allocation, &shard_id, node, true, None, None)
            }
            AllocationCommand::Move {
                from_node, to_node, ..
            } => self.execute_move(allocation, &shard_id, from_node, to_node),
            AllocationCommand::Cancel {
                node,
                allow_primary,
                ..
            } => self.execute_cancel(allocation, &shard_id, node, *allow_primary),
        }
    }

    fn execute_allocate(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        shard_id: &ShardId,
        node: &str,
        primary: bool,
        existing_allocation_id: Option<&str>,
        known_size: Option<i64>,
    ) -> Result<()> {
        if !allocation.nodes().contains(node) {
            return Err(AllocationError::CommandRejected(format!(
                "{}: node {} is not part of the cluster",
                self.describe(),
                node
            )));
        }
        if !primary
            && allocation
                .routing_nodes()
                .active_primary(shard_id)
                .is_none()
        {
            return Err(AllocationError::CommandRejected(format!(
                "{}: primary of {} is not active",
                self.describe(),
                shard_id
            )));
        }

        let shard = allocation
            .routing_nodes()
            .unassigned()
            .iter()
            .find(|s| s.primary == primary && s.shard_id == *shard_id)
            .cloned()
            .ok_or_else(|| {
                AllocationError::CommandRejected(format!(
                    "{}: no unassigned {} for {}",
                    self.describe(),
                    if primary { "primary" } else { "replica" },
                    shard_id
                ))
            })?;

        let node_view = allocation.routing_nodes().node(node).ok_or_else(|| {
            AllocationError::CommandRejected(format!(
                "{}: node {} holds no routing entry",
                self.describe(),
                node
            ))
        })?;
        let aggregate = allocation.deciders().can_allocate(&shard, node_view, allocation);
        let decision = aggregate.decision;
        allocation
            .explanations_mut()
            .push(self.describe(), aggregate.decisions);
        if decision == Decision::No {
            return Err(AllocationError::CommandRejected(format!(
                "{}: refused by deciders",
                self.describe()
            )));
        }

        let shard = allocation
            .routing_nodes_mut()
            .unassigned_mut()
            .remove_first(|s| s.primary == primary && s.shard_id == *shard_id)
            .ok_or_else(|| AllocationError::InvariantViolation("queued shard vanished".into()))?;
        let size = known_size.unwrap_or_else(|| {
            allocation
                .info()
                .shard_size_or(shard_id, ShardRouting::UNKNOWN_EXPECTED_SIZE)
        });
        allocation
            .routing_nodes_mut()
            .initialize(shard, node, existing_allocation_id, size)?;
        Ok(())
    }

    fn execute_move(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        shard_id: &ShardId,
        from_node: &str,
        to_node: &str,
    ) -> Result<()> {
        let shard = allocation
            .routing_nodes()
            .shard_on_node(shard_id, from_node)
            .cloned()
            .ok_or_else(|| {
                AllocationError::CommandRejected(format!(
                    "{}: shard {} is not on node {}",
                    self.describe(),
                    shard_id,
                    from_node
                ))
            })?;
        if !shard.is_started() {
            return Err(AllocationError::CommandRejected(format!(
                "{}: shard is {} and only started shards move",
                self.describe(),
                shard.state.as_str()
            )));
        }
        let node_view = allocation.routing_nodes().node(to_node).ok_or_else(|| {
            AllocationError::CommandRejected(format!(
                "{}: node {} is not part of the cluster",
                self.describe(),
                to_node
            ))
        })?;
        let aggregate = allocation.deciders().can_allocate(&shard, node_view, allocation);
        let decision = aggregate.decision;
        allocation
            .explanations_mut()
            .push(self.describe(), aggregate.decisions);
        if decision != Decision::Yes {
            return Err(AllocationError::CommandRejected(format!(
                "{}: refused by deciders",
                self.describe()
            )));
        }

        let size = allocation
            .info()
            .shard_size_or(shard_id, shard.expected_size_bytes);
        allocation.routing_nodes_mut().relocate(&shard, to_node, size)?;
        Ok(())
    }

    fn execute_cancel(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        shard_id: &ShardId,
        node: &str,
        allow_primary: bool,
    ) -> Result<()> {
        let shard = allocation
            .routing_nodes()
            .shard_on_node(shard_id, node)
            .cloned()
            .ok_or_else(|| {
                AllocationError::CommandRejected(format!(
                    "{}: shard {} is not on node {}",
                    self.describe(),
                    shard_id,
                    node
                ))
            })?;
        if shard.primary && !allow_primary {
            return Err(AllocationError::CommandRejected(format!(
                "{}: cancelling a primary requires allow_primary",
                self.describe()
            )));
        }

        match shard.state {
            ShardRoutingState::Relocating => {
                allocation.routing_nodes_mut().cancel_relocation(&shard)
            }
            ShardRoutingState::Initializing if shard.is_relocation_target() => {
                let source = shard
                    .relocating_node
                    .as_deref()
                    .and_then(|source_node| {
                        allocation
                            .routing_nodes()
                            .shard_on_node(shard_id, source_node)
                            .cloned()
                    })
                    .ok_or_else(|| {
                        AllocationError::InvariantViolation(format!(
                            "relocation target {} has no source",
                            shard.describe()
                        ))
                    })?;
                allocation.routing_nodes_mut().cancel_relocation(&source)
            }
            ShardRoutingState::Initializing => {
                let failed_allocations = shard
                    .unassigned_info
                    .as_ref()
                    .map(|i| i.failed_allocations)
                    .unwrap_or(0);
                let cancel_info = UnassignedInfo::new(
                    UnassignedReason::RerouteCancelled,
                    allocation.current_nanos(),
                    allocation.current_millis(),
                )
                .with_message("cancelled by an allocation command")
                .with_failed_allocations(failed_allocations);
                allocation.routing_nodes_mut().fail_shard(&shard, cancel_info)
            }
            _ => Err(AllocationError::CommandRejected(format!(
                "{}: shard is {} and cannot be cancelled",
                self.describe(),
                shard.state.as_str()
            ))),
        }
    }
}

/// Execute a batch of commands atomically against the working copy
pub fn execute_commands(
    allocation: &mut RoutingAllocation<'_>,
    commands: &[AllocationCommand],
    gateway: &GatewayAllocator,
) -> Result<()> {
    allocation.set_ignore_disable(true);
    let result = commands
        .iter()
        .try_for_each(|c| c.execute(allocation, gateway));
    allocation.set_ignore_disable(false);
    result
}
