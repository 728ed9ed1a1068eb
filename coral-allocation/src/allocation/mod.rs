//! The allocation pass: context, commands, reconciliation, orchestration.

mod commands;
mod context;
mod explain;
mod reconcile;
mod service;

pub use commands::{execute_commands, AllocationCommand};
pub use context::RoutingAllocation;
pub use explain::{ExplanationEntry, RoutingExplanations};
pub use reconcile::reconcile;
pub use service::{AllocationService, FailedShard, RerouteResult};
