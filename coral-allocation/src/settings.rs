//! Cluster-level allocation settings
//!
//! Index-level settings (replica counts, delayed timeouts, index filters) live
//! on `IndexMetadata`; everything here applies cluster-wide and is consulted
//! by the decider stack and the balancer on every pass.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which shards the cluster is currently willing to allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationEnable {
    /// Allocate every shard
    #[default]
    All,
    /// Allocate primaries only
    Primaries,
    /// Allocate only primaries of newly created indices
    NewPrimaries,
    /// Allocate nothing
    None,
}

/// Disk watermarks as fractions of total capacity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiskWatermarks {
    /// No new shards above this usage
    #[serde(default = "default_watermark_low")]
    pub low: f64,

    /// Shards should be moved off nodes above this usage
    #[serde(default = "default_watermark_high")]
    pub high: f64,

    /// Hard stop; nothing allocates and everything should leave
    #[serde(default = "default_watermark_flood_stage")]
    pub flood_stage: f64,
}

fn default_watermark_low() -> f64 {
    0.85
}

fn default_watermark_high() -> f64 {
    0.90
}

fn default_watermark_flood_stage() -> f64 {
    0.95
}

impl Default for DiskWatermarks {
    fn default() -> Self {
        Self {
            low: default_watermark_low(),
            high: default_watermark_high(),
            flood_stage: default_watermark_flood_stage(),
        }
    }
}

/// Cluster-wide attribute filters applied to every index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AllocationFilters {
    /// Node must match every entry
    #[serde(default)]
    pub require: BTreeMap<String, String>,

    /// Node must match at least one entry when any are present
    #[serde(default)]
    pub include: BTreeMap<String, String>,

    /// Node must match no entry
    #[serde(default)]
    pub exclude: BTreeMap<String, String>,
}

impl AllocationFilters {
    pub fn is_empty(&self) -> bool {
        self.require.is_empty() && self.include.is_empty() && self.exclude.is_empty()
    }
}

/// Weights and threshold for the balanced shards allocator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceSettings {
    /// Weight of per-index shard counts in the node weight function
    #[serde(default = "default_index_balance")]
    pub index_balance: f32,

    /// Weight of total shard counts in the node weight function
    #[serde(default = "default_shard_balance")]
    pub shard_balance: f32,

    /// Minimum weight delta before a rebalance move is worth making
    #[serde(default = "default_balance_threshold")]
    pub threshold: f32,
}

fn default_index_balance() -> f32 {
    0.55
}

fn default_shard_balance() -> f32 {
    0.45
}

fn default_balance_threshold() -> f32 {
    1.0
}

impl Default for BalanceSettings {
    fn default() -> Self {
        Self {
            index_balance: default_index_balance(),
            shard_balance: default_shard_balance(),
            threshold: default_balance_threshold(),
        }
    }
}

/// Main allocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationSettings {
    /// Cluster-wide allocation gate
    #[serde(default)]
    pub enable: AllocationEnable,

    /// Maximum concurrent incoming recoveries per node
    #[serde(default = "default_concurrent_recoveries")]
    pub node_concurrent_incoming_recoveries: usize,

    /// Maximum concurrent outgoing recoveries per node
    #[serde(default = "default_concurrent_recoveries")]
    pub node_concurrent_outgoing_recoveries: usize,

    /// Disk usage watermarks
    #[serde(default)]
    pub disk: DiskWatermarks,

    /// Refuse to co-locate copies of a shard on nodes sharing a `host` attribute
    #[serde(default)]
    pub same_shard_host: bool,

    /// Node attributes treated as failure domains (e.g. `zone`, `rack`)
    #[serde(default)]
    pub awareness_attributes: Vec<String>,

    /// Cluster-level node filters
    #[serde(default)]
    pub filters: AllocationFilters,

    /// Give up allocating a shard after this many failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Hard cap on shards per node; unlimited when absent
    #[serde(default)]
    pub max_shards_per_node: Option<usize>,

    /// Balancer weights
    #[serde(default)]
    pub balance: BalanceSettings,
}

fn default_concurrent_recoveries() -> usize {
    2
}

fn default_max_retries() -> u32 {
    5
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            enable: AllocationEnable::default(),
            node_concurrent_incoming_recoveries: default_concurrent_recoveries(),
            node_concurrent_outgoing_recoveries: default_concurrent_recoveries(),
            disk: DiskWatermarks::default(),
            same_shard_host: false,
            awareness_attributes: Vec::new(),
            filters: AllocationFilters::default(),
            max_retries: default_max_retries(),
            max_shards_per_node: None,
            balance: BalanceSettings::default(),
        }
    }
}

impl AllocationSettings {
    /// Convenience constructor with a single recovery cap for both directions
    pub fn with_concurrent_recoveries(mut self, recoveries: usize) -> Self {
        self.node_concurrent_incoming_recoveries = recoveries;
        self.node_concurrent_outgoing_recoveries = recoveries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AllocationSettings::default();
        assert_eq!(settings.enable, AllocationEnable::All);
        assert_eq!(settings.node_concurrent_incoming_recoveries, 2);
        assert_eq!(settings.max_retries, 5);
        assert!(settings.max_shards_per_node.is_none());
        assert!(settings.filters.is_empty());
    }

    #[test]
    fn test_watermark_ordering() {
        let disk = DiskWatermarks::default();
        assert!(disk.low < disk.high);
        assert!(disk.high < disk.flood_stage);
    }

    #[test]
    fn test_enable_deserializes_snake_case() {
        let enable: AllocationEnable = serde_json::from_str("\"new_primaries\"").unwrap();
        assert_eq!(enable, AllocationEnable::NewPrimaries);
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: AllocationSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.node_concurrent_outgoing_recoveries, 2);
        assert_eq!(settings.balance.threshold, 1.0);
    }
}
