//! Routing model: shard copies, their placement, and the mutable view a
//! reroute pass works on.

mod allocation_id;
mod nodes;
mod shard;
mod table;
mod unassigned;

pub use allocation_id::AllocationId;
pub use nodes::{RoutingNode, RoutingNodes};
pub use shard::{ShardId, ShardRouting, ShardRoutingState};
pub use table::{IndexRoutingTable, RoutingTable, ShardRoutingTable};
pub use unassigned::{AllocationStatus, UnassignedInfo, UnassignedReason, UnassignedShards};
