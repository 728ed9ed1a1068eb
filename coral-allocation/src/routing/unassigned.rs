//! Unassigned shard bookkeeping
//!
//! `UnassignedInfo` records why a copy is without a node and how previous
//! allocation attempts went; `UnassignedShards` is the ordered queue the
//! allocators drain during a pass, with a side list for shards that cannot be
//! placed this pass.

use super::shard::ShardRouting;
use serde::{Deserialize, Serialize};

/// Why a shard became unassigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedReason {
    /// Index was just created
    IndexCreated,
    /// Full-cluster restart recovered known indices
    ClusterRecovered,
    /// A recovery attempt failed
    AllocationFailed,
    /// The node holding the copy left the cluster
    NodeLeft,
    /// An administrative cancel returned the copy to the queue
    RerouteCancelled,
    /// The copy was forcibly reinitialized
    Reinitialized,
    /// Replica count was raised
    ReplicaAdded,
    /// The copy's primary failed
    PrimaryFailed,
}

/// Outcome of the most recent allocation attempt for an unassigned shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// No attempt has been made yet
    #[default]
    NoAttempt,
    /// A decider returned THROTTLE; retried on a later pass
    Throttled,
    /// Every candidate node was refused by a decider
    DecidersNo,
    /// Store information is still being fetched
    FetchingShardData,
    /// Store fetch completed and no usable copy exists
    NoValidShardCopy,
    /// Allocation is intentionally delayed after a node left
    DelayedAllocation,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::NoAttempt => "no_attempt",
            AllocationStatus::Throttled => "throttled",
            AllocationStatus::DecidersNo => "deciders_no",
            AllocationStatus::FetchingShardData => "fetching_shard_data",
            AllocationStatus::NoValidShardCopy => "no_valid_shard_copy",
            AllocationStatus::DelayedAllocation => "delayed_allocation",
        }
    }
}

/// Metadata attached to an unassigned (or re-initializing after failure) copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnassignedInfo {
    pub reason: UnassignedReason,

    /// Operator-facing detail, e.g. the failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Number of failed allocation attempts since the copy was last active
    #[serde(default)]
    pub failed_allocations: u32,

    /// Pass clock at the moment the copy became unassigned
    pub unassigned_since_nanos: i64,

    /// Wall clock counterpart, for operators
    pub unassigned_since_millis: i64,

    /// Whether allocation is held back by the index's node-left delay
    #[serde(default)]
    pub delayed: bool,

    /// Outcome of the most recent allocation attempt
    #[serde(default)]
    pub last_allocation_status: AllocationStatus,
}

impl UnassignedInfo {
    pub fn new(reason: UnassignedReason, since_nanos: i64, since_millis: i64) -> Self {
        Self {
            reason,
            message: None,
            failed_allocations: 0,
            unassigned_since_nanos: since_nanos,
            unassigned_since_millis: since_millis,
            delayed: false,
            last_allocation_status: AllocationStatus::NoAttempt,
        }
    }

    /// Builder-style: attach a message
    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    /// Builder-style: set the failure counter
    pub fn with_failed_allocations(mut self, failed: u32) -> Self {
        self.failed_allocations = failed;
        self
    }

    /// Builder-style: mark the copy as delay-held
    pub fn with_delayed(mut self, delayed: bool) -> Self {
        self.delayed = delayed;
        self
    }

    /// Nanoseconds of node-left delay still to honor at `now_nanos`, given the
    /// index timeout. Zero once expired or when the copy is not delay-held.
    pub fn remaining_delay_nanos(&self, now_nanos: i64, timeout_millis: u64) -> i64 {
        if !self.delayed {
            return 0;
        }
        let timeout_nanos = timeout_millis as i64 * 1_000_000;
        (timeout_nanos - (now_nanos - self.unassigned_since_nanos)).max(0)
    }
}

/// Ordered queue of unassigned shards for one routing view
///
/// Allocators drain the queue and either place each shard or park it on the
/// ignored list with an updated `AllocationStatus`; at the end of the pass the
/// ignored shards are folded back in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnassignedShards {
    queue: Vec<ShardRouting>,
    ignored: Vec<ShardRouting>,
}

impl UnassignedShards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, shard: ShardRouting) {
        debug_assert!(shard.is_unassigned());
        self.queue.push(shard);
    }

    pub fn len(&self) -> usize {
        self.queue.len() + self.ignored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.ignored.is_empty()
    }

    /// Shards currently eligible for allocation this pass
    pub fn iter(&self) -> impl Iterator<Item = &ShardRouting> {
        self.queue.iter()
    }

    /// Every unassigned shard, including ones parked for this pass
    pub fn iter_all(&self) -> impl Iterator<Item = &ShardRouting> {
        self.queue.iter().chain(self.ignored.iter())
    }

    /// Take the whole eligible queue for processing
    pub fn drain_queue(&mut self) -> Vec<ShardRouting> {
        std::mem::take(&mut self.queue)
    }

    /// Return an unplaced shard to the back of the eligible queue
    pub fn push_back(&mut self, shard: ShardRouting) {
        self.queue.push(shard);
    }

    /// Park a shard for the rest of this pass, recording the attempt outcome
    pub fn ignore(&mut self, mut shard: ShardRouting, status: AllocationStatus) {
        if let Some(info) = shard.unassigned_info.as_mut() {
            info.last_allocation_status = status;
        }
        self.ignored.push(shard);
    }

    /// Fold parked shards back into the queue at the end of a pass
    pub fn resolve_ignored(&mut self) {
        let mut ignored = std::mem::take(&mut self.ignored);
        self.queue.append(&mut ignored);
    }

    /// Rotate the eligible queue so a poison head cannot starve the rest
    pub fn rotate(&mut self, by: usize) {
        if self.queue.len() > 1 {
            let mid = by % self.queue.len();
            self.queue.rotate_left(mid);
        }
    }

    /// Remove the first queued shard matching the predicate
    pub fn remove_first<F>(&mut self, pred: F) -> Option<ShardRouting>
    where
        F: Fn(&ShardRouting) -> bool,
    {
        let pos = self.queue.iter().position(|s| pred(s))?;
        Some(self.queue.remove(pos))
    }

    /// Update unassigned info in place across the eligible queue
    pub fn update_info<F>(&mut self, mut update: F)
    where
        F: FnMut(&mut ShardRouting),
    {
        for shard in self.queue.iter_mut() {
            update(shard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Index;
    use crate::routing::shard::ShardId;

    fn make_unassigned(id: u32) -> ShardRouting {
        ShardRouting::new_unassigned(
            ShardId::new(Index::new("logs", "uuid-1"), id),
            true,
            UnassignedInfo::new(UnassignedReason::IndexCreated, 0, 0),
        )
    }

    #[test]
    fn test_remaining_delay() {
        let info = UnassignedInfo::new(UnassignedReason::NodeLeft, 1_000_000_000, 1_000)
            .with_delayed(true);

        // 60s timeout, 10s elapsed
        let remaining = info.remaining_delay_nanos(11_000_000_000, 60_000);
        assert_eq!(remaining, 50_000_000_000);

        // Exactly at the boundary
        assert_eq!(info.remaining_delay_nanos(61_000_000_000, 60_000), 0);

        // Not delayed at all
        let plain = UnassignedInfo::new(UnassignedReason::NodeLeft, 0, 0);
        assert_eq!(plain.remaining_delay_nanos(5, 60_000), 0);
    }

    #[test]
    fn test_ignore_updates_status() {
        let mut unassigned = UnassignedShards::new();
        unassigned.push(make_unassigned(0));

        let drained = unassigned.drain_queue();
        assert_eq!(drained.len(), 1);
        assert!(unassigned.is_empty());

        for shard in drained {
            unassigned.ignore(shard, AllocationStatus::Throttled);
        }
        assert_eq!(unassigned.len(), 1);
        assert_eq!(unassigned.iter().count(), 0);

        unassigned.resolve_ignored();
        let statuses: Vec<_> = unassigned
            .iter()
            .map(|s| s.unassigned_info.as_ref().unwrap().last_allocation_status)
            .collect();
        assert_eq!(statuses, vec![AllocationStatus::Throttled]);
    }

    #[test]
    fn test_rotation_preserves_membership() {
        let mut unassigned = UnassignedShards::new();
        for id in 0..4 {
            unassigned.push(make_unassigned(id));
        }

        unassigned.rotate(6);
        let ids: Vec<_> = unassigned.iter().map(|s| s.shard_id.id).collect();
        assert_eq!(ids, vec![2, 3, 0, 1]);
    }

    #[test]
    fn test_remove_first() {
        let mut unassigned = UnassignedShards::new();
        for id in 0..3 {
            unassigned.push(make_unassigned(id));
        }

        let removed = unassigned.remove_first(|s| s.shard_id.id == 1).unwrap();
        assert_eq!(removed.shard_id.id, 1);
        assert_eq!(unassigned.len(), 2);
        assert!(unassigned.remove_first(|s| s.shard_id.id == 9).is_none());
    }
}
