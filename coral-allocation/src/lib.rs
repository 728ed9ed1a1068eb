//! Coral Allocation - shard allocation and cluster routing for Coral cluster mode
//!
//! This crate decides where shards live. Given an immutable cluster state
//! snapshot (live nodes, index metadata, routing table) and a batch of events
//! (shards started or failed, nodes gone, administrative commands), it
//! produces a new routing table that moves the cluster toward a legal,
//! balanced placement, along with reconciled index metadata and health
//! transitions.
//!
//! # Architecture
//!
//! - **AllocationService**: entry points and the commit protocol
//! - **RoutingAllocation**: per-pass transaction context over a mutable working copy
//! - **RoutingNodes**: the shard-level state machine (initialize, relocate, start, fail)
//! - **Deciders**: ordered YES/NO/THROTTLE constraint stack with explanations
//! - **BalancedShardsAllocator**: weight-based placement and rebalancing strategy
//! - **GatewayAllocator**: recovery placement for shards with existing on-disk data
//! - **Reconciliation**: in-sync allocation ids and primary terms follow routing at commit
//!
//! # Model
//!
//! ```text
//! Shard lifecycle: UNASSIGNED → INITIALIZING → STARTED → RELOCATING
//!
//! Every pass: apply events → reroute (gateway, then balancer, under the
//! deciders) → reconcile metadata → validate → emit
//! ```
//!
//! The pass is synchronous and single-writer: callers serialize invocations
//! and supply blocking information (disk usage, shard stores) as precomputed
//! oracles. An unchanged pass returns the input table and metadata by
//! identity so callers can short-circuit publication.

pub mod allocation;
pub mod allocator;
pub mod cluster;
pub mod deciders;
pub mod error;
pub mod gateway;
pub mod info;
pub mod metrics;
pub mod routing;
pub mod settings;
pub mod time;

pub use allocation::{
    execute_commands, AllocationCommand, AllocationService, FailedShard, RerouteResult,
    RoutingAllocation, RoutingExplanations,
};
pub use allocator::{BalancedShardsAllocator, ShardsAllocator};
pub use cluster::{
    ClusterHealth, ClusterHealthStatus, ClusterState, DiscoveryNode, DiscoveryNodes, HealthChange,
    Index, IndexMetadata, Metadata, NodeRole,
};
pub use deciders::{AllocationDecider, AllocationDeciders, Decision};
pub use error::{AllocationError, Result};
pub use gateway::{GatewayAllocator, ShardStoreOracle, SharedStoreOracle, StoreCopy, StoreFetch};
pub use info::{ClusterInfo, ClusterInfoSource, DiskUsage, SharedClusterInfo};
pub use routing::{
    AllocationId, AllocationStatus, RoutingNode, RoutingNodes, RoutingTable, ShardId,
    ShardRouting, ShardRoutingState, UnassignedInfo, UnassignedReason,
};
pub use settings::{AllocationEnable, AllocationSettings};
pub use time::{Clock, ManualClock, SystemClock};
