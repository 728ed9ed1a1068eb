//! Constraint evaluation for shard placement
//!
//! A decider is a pure function from `(shard, node, allocation)` to a
//! YES/NO/THROTTLE verdict with an optional reason. The stack evaluates an
//! ordered list with short-circuit aggregation: the first NO wins, otherwise
//! THROTTLE dominates YES. In debug mode every decider runs and every verdict
//! is recorded for the explain surface.

mod awareness;
mod disk_threshold;
mod enable;
mod filter;
mod max_retry;
mod replica_after_primary;
mod same_shard;
mod shards_limit;
mod throttling;

pub use awareness::AwarenessDecider;
pub use disk_threshold::DiskThresholdDecider;
pub use enable::EnableDecider;
pub use filter::FilterDecider;
pub use max_retry::MaxRetryDecider;
pub use replica_after_primary::ReplicaAfterPrimaryDecider;
pub use same_shard::SameShardDecider;
pub use shards_limit::ShardsLimitDecider;
pub use throttling::ThrottlingDecider;

use crate::allocation::RoutingAllocation;
use crate::routing::{RoutingNode, ShardRouting};
use serde::{Deserialize, Serialize};

/// Outcome of one constraint check
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// The placement is allowed
    Yes,
    /// The placement is allowed but not right now
    Throttle,
    /// The placement is forbidden
    No,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Yes => "yes",
            Decision::Throttle => "throttle",
            Decision::No => "no",
        }
    }
}

/// A single decider's verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeciderVerdict {
    pub decision: Decision,
    pub reason: Option<String>,
}

impl DeciderVerdict {
    pub fn yes() -> Self {
        Self {
            decision: Decision::Yes,
            reason: None,
        }
    }

    pub fn no(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::No,
            reason: Some(reason.into()),
        }
    }

    pub fn throttle(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Throttle,
            reason: Some(reason.into()),
        }
    }
}

/// One recorded decider verdict, as surfaced in explanations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeciderDecision {
    pub decider: String,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Aggregated stack verdict plus the per-decider log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateDecision {
    pub decision: Decision,
    pub decisions: Vec<DeciderDecision>,
}

impl AggregateDecision {
    fn single(decider: &str, verdict: DeciderVerdict) -> Self {
        Self {
            decision: verdict.decision,
            decisions: vec![DeciderDecision {
                decider: decider.to_string(),
                decision: verdict.decision,
                message: verdict.reason,
            }],
        }
    }
}

/// A pluggable placement constraint
///
/// Implementations must be pure: verdicts may depend only on the arguments,
/// never on hidden state, so dry-run passes reproduce exactly.
pub trait AllocationDecider: Send + Sync {
    fn name(&self) -> &'static str;

    /// May `shard` be placed on `node`?
    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        _node: &RoutingNode,
        _allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        DeciderVerdict::yes()
    }

    /// May `shard` stay on `node`?
    fn can_remain(
        &self,
        _shard: &ShardRouting,
        _node: &RoutingNode,
        _allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        DeciderVerdict::yes()
    }

    /// May `shard` be moved for balancing right now?
    fn can_rebalance(
        &self,
        _shard: &ShardRouting,
        _allocation: &RoutingAllocation<'_>,
    ) -> DeciderVerdict {
        DeciderVerdict::yes()
    }
}

/// The ordered decider stack
pub struct AllocationDeciders {
    deciders: Vec<Box<dyn AllocationDecider>>,
}

impl AllocationDeciders {
    pub fn new(deciders: Vec<Box<dyn AllocationDecider>>) -> Self {
        Self { deciders }
    }

    /// The standard stack, in evaluation order
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(MaxRetryDecider),
            Box::new(ReplicaAfterPrimaryDecider),
            Box::new(EnableDecider),
            Box::new(SameShardDecider),
            Box::new(FilterDecider),
            Box::new(ShardsLimitDecider),
            Box::new(AwarenessDecider),
            Box::new(DiskThresholdDecider),
            Box::new(ThrottlingDecider),
        ])
    }

    pub fn len(&self) -> usize {
        self.deciders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deciders.is_empty()
    }

    /// Aggregate `can_allocate` over the stack. Shards recently failed on a
    /// node are refused before any decider runs.
    pub fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> AggregateDecision {
        if allocation.is_ignored(node.node_id(), &shard.shard_id) {
            return AggregateDecision::single(
                "ignored_shards",
                DeciderVerdict::no(format!(
                    "shard {} failed on node {} during this pass",
                    shard.shard_id,
                    node.node_id()
                )),
            );
        }
        self.aggregate(allocation, |decider| decider.can_allocate(shard, node, allocation))
    }

    /// Aggregate `can_remain` over the stack
    pub fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> AggregateDecision {
        self.aggregate(allocation, |decider| decider.can_remain(shard, node, allocation))
    }

    /// Aggregate `can_rebalance` over the stack
    pub fn can_rebalance(
        &self,
        shard: &ShardRouting,
        allocation: &RoutingAllocation<'_>,
    ) -> AggregateDecision {
        self.aggregate(allocation, |decider| decider.can_rebalance(shard, allocation))
    }

    fn aggregate<F>(&self, allocation: &RoutingAllocation<'_>, mut check: F) -> AggregateDecision
    where
        F: FnMut(&dyn AllocationDecider) -> DeciderVerdict,
    {
        let debug = allocation.debug_decision();
        let mut decision = Decision::Yes;
        let mut decisions = Vec::new();

        for decider in &self.deciders {
            let verdict = check(decider.as_ref());
            // Non-YES verdicts are always recorded so statuses can cite the
            // responsible decider; debug mode records everything.
            if debug || verdict.decision != Decision::Yes {
                decisions.push(DeciderDecision {
                    decider: decider.name().to_string(),
                    decision: verdict.decision,
                    message: verdict.reason,
                });
            }
            decision = decision.max(verdict.decision);
            if decision == Decision::No && !debug {
                break;
            }
        }

        AggregateDecision {
            decision,
            decisions,
        }
    }
}
