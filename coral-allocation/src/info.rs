//! Cluster resource information consumed by allocation decisions
//!
//! Disk usage and shard sizes are gathered asynchronously by the embedding
//! process; a reroute pass only ever sees a precomputed snapshot. A missing
//! entry means "unknown" and deciders must treat it permissively.

use crate::routing::ShardId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Disk usage of a single node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl DiskUsage {
    pub fn new(total_bytes: u64, used_bytes: u64) -> Self {
        Self {
            total_bytes,
            used_bytes,
        }
    }

    /// Used fraction of the disk, 0.0 when capacity is unknown
    pub fn used_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64
        }
    }

    /// Used fraction after hypothetically adding `extra_bytes`
    pub fn used_fraction_after(&self, extra_bytes: i64) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let projected = self.used_bytes as i64 + extra_bytes.max(0);
        projected as f64 / self.total_bytes as f64
    }

    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// Immutable snapshot of per-node disk usage and per-shard size estimates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    disk_usage: BTreeMap<String, DiskUsage>,
    shard_sizes: BTreeMap<ShardId, i64>,
}

impl ClusterInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: record disk usage for a node
    pub fn with_disk_usage(mut self, node_id: &str, usage: DiskUsage) -> Self {
        self.disk_usage.insert(node_id.to_string(), usage);
        self
    }

    /// Builder-style: record a size estimate for a shard
    pub fn with_shard_size(mut self, shard_id: ShardId, size_bytes: i64) -> Self {
        self.shard_sizes.insert(shard_id, size_bytes);
        self
    }

    pub fn disk_usage(&self, node_id: &str) -> Option<&DiskUsage> {
        self.disk_usage.get(node_id)
    }

    pub fn shard_size(&self, shard_id: &ShardId) -> Option<i64> {
        self.shard_sizes.get(shard_id).copied()
    }

    /// Size estimate falling back to a default when the shard is unknown
    pub fn shard_size_or(&self, shard_id: &ShardId, default: i64) -> i64 {
        self.shard_size(shard_id).unwrap_or(default)
    }
}

/// Provider of `ClusterInfo` snapshots, one per reroute pass
pub trait ClusterInfoSource: Send + Sync {
    fn latest(&self) -> ClusterInfo;
}

/// Source that always reports nothing; deciders fall back to permissive defaults
#[derive(Debug, Default)]
pub struct EmptyClusterInfo;

impl ClusterInfoSource for EmptyClusterInfo {
    fn latest(&self) -> ClusterInfo {
        ClusterInfo::default()
    }
}

/// Settable source, updated by whatever gathers node stats
#[derive(Default)]
pub struct SharedClusterInfo {
    current: RwLock<ClusterInfo>,
}

impl SharedClusterInfo {
    pub fn new(info: ClusterInfo) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(info),
        })
    }

    pub fn update(&self, info: ClusterInfo) {
        *self.current.write() = info;
    }
}

impl ClusterInfoSource for SharedClusterInfo {
    fn latest(&self) -> ClusterInfo {
        self.current.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Index;

    fn make_shard_id() -> ShardId {
        ShardId::new(Index::new("logs", "uuid-1"), 0)
    }

    #[test]
    fn test_disk_usage_fraction() {
        let usage = DiskUsage::new(100, 92);
        assert!((usage.used_fraction() - 0.92).abs() < f64::EPSILON);
        assert_eq!(usage.free_bytes(), 8);
    }

    #[test]
    fn test_disk_usage_unknown_capacity() {
        let usage = DiskUsage::new(0, 42);
        assert_eq!(usage.used_fraction(), 0.0);
    }

    #[test]
    fn test_projected_usage() {
        let usage = DiskUsage::new(100, 80);
        assert!((usage.used_fraction_after(15) - 0.95).abs() < f64::EPSILON);
        // Negative estimates are treated as unknown
        assert!((usage.used_fraction_after(-1) - 0.80).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cluster_info_lookup() {
        let shard = make_shard_id();
        let info = ClusterInfo::new()
            .with_disk_usage("node-1", DiskUsage::new(100, 50))
            .with_shard_size(shard.clone(), 1024);

        assert_eq!(info.disk_usage("node-1").unwrap().used_bytes, 50);
        assert!(info.disk_usage("node-2").is_none());
        assert_eq!(info.shard_size(&shard), Some(1024));
        assert_eq!(info.shard_size_or(&shard, -1), 1024);
    }

    #[test]
    fn test_shared_source_updates() {
        let source = SharedClusterInfo::new(ClusterInfo::default());
        assert!(source.latest().disk_usage("node-1").is_none());

        source.update(ClusterInfo::new().with_disk_usage("node-1", DiskUsage::new(10, 1)));
        assert!(source.latest().disk_usage("node-1").is_some());
    }
}
