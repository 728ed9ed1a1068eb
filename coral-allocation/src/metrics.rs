//! Allocation observability metrics
//!
//! Prometheus-compatible metrics emitted at commit time:
//! - Shard state gauges (active/initializing/relocating/unassigned)
//! - Cluster health gauge
//! - Reroute pass duration
//! - Promotion and relocation counters

use crate::cluster::{ClusterHealth, ClusterHealthStatus};
use std::time::Duration;

/// Record the duration of one reroute pass
pub fn record_reroute_duration(reason: &str, duration: Duration) {
    metrics::histogram!(
        "coral_allocation_reroute_duration_seconds",
        "reason" => reason.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record that a reroute pass produced a changed routing table
pub fn record_reroute_result(reason: &str, changed: bool) {
    metrics::counter!(
        "coral_allocation_reroutes_total",
        "reason" => reason.to_string(),
        "changed" => if changed { "true" } else { "false" },
    )
    .increment(1);
}

/// Record a primary promotion after a primary failure
pub fn record_primary_promotion(index: &str) {
    metrics::counter!(
        "coral_allocation_primary_promotions_total",
        "index" => index.to_string(),
    )
    .increment(1);
}

/// Record a started relocation
pub fn record_relocation(index: &str, from_node: &str, to_node: &str) {
    metrics::counter!(
        "coral_allocation_relocations_total",
        "index" => index.to_string(),
        "from_node" => from_node.to_string(),
        "to_node" => to_node.to_string(),
    )
    .increment(1);
}

/// Record an executed administrative command
pub fn record_command(command: &str) {
    metrics::counter!(
        "coral_allocation_commands_total",
        "command" => command.to_string(),
    )
    .increment(1);
}

/// Update shard state gauges from a health summary
pub fn update_shard_gauges(health: &ClusterHealth) {
    metrics::gauge!("coral_allocation_shards_active").set(health.active_shards as f64);
    metrics::gauge!("coral_allocation_shards_initializing").set(health.initializing_shards as f64);
    metrics::gauge!("coral_allocation_shards_relocating").set(health.relocating_shards as f64);
    metrics::gauge!("coral_allocation_shards_unassigned").set(health.unassigned_shards as f64);
    metrics::gauge!("coral_allocation_shards_delayed_unassigned")
        .set(health.delayed_unassigned_shards as f64);
    update_health_status(health.status);
}

/// Update the cluster health gauge
pub fn update_health_status(status: ClusterHealthStatus) {
    let value = match status {
        ClusterHealthStatus::Green => 0.0,
        ClusterHealthStatus::Yellow => 1.0,
        ClusterHealthStatus::Red => 2.0,
    };
    metrics::gauge!("coral_allocation_health_status").set(value);
}

/// Record a health transition
pub fn record_health_change(from: ClusterHealthStatus, to: ClusterHealthStatus) {
    metrics::counter!(
        "coral_allocation_health_changes_total",
        "from" => from.as_str().to_string(),
        "to" => to.as_str().to_string(),
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emission_does_not_panic_without_recorder() {
        record_reroute_duration("test", Duration::from_millis(3));
        record_reroute_result("test", true);
        record_primary_promotion("logs");
        record_relocation("logs", "node-1", "node-2");
        record_command("move");
        update_health_status(ClusterHealthStatus::Yellow);
        record_health_change(ClusterHealthStatus::Green, ClusterHealthStatus::Red);
    }
}
