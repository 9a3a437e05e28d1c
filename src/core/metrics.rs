// src/core/metrics.rs

//! Defines and registers Prometheus metrics for cluster-membership monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram, TextEncoder,
};

lazy_static! {
    /// The number of members currently known to the registry.
    pub static ref MEMBERS_TOTAL: Gauge =
        register_gauge!("clusterd_members_total", "Number of members currently known to the registry.").unwrap();
    /// A boolean gauge indicating whether this node currently holds leadership.
    pub static ref IS_LEADER: Gauge =
        register_gauge!("clusterd_is_leader", "Indicates if this node is currently the leader (1 for true, 0 for false).").unwrap();
    /// The number of members currently in the `evacuated` state.
    pub static ref EVACUATED_MEMBERS: Gauge =
        register_gauge!("clusterd_evacuated_members", "Number of members currently evacuated.").unwrap();

    /// Total join-token operations created, labeled by outcome (`issued`, `cancelled`, `denied`).
    pub static ref JOIN_TOKENS_TOTAL: CounterVec =
        register_counter_vec!("clusterd_join_tokens_total", "Total join-token operations, labeled by outcome.", &["outcome"]).unwrap();
    /// Total rebalance passes run, labeled by outcome (`applied`, `no_op`, `aborted_not_leader`).
    pub static ref REBALANCE_PASSES_TOTAL: CounterVec =
        register_counter_vec!("clusterd_rebalance_passes_total", "Total rebalance passes, labeled by outcome.", &["outcome"]).unwrap();
    /// Total evacuate/restore operations, labeled by `kind` (`evacuate`, `restore`) and `outcome`.
    pub static ref EVACUATION_OPERATIONS_TOTAL: CounterVec =
        register_counter_vec!("clusterd_evacuation_operations_total", "Total evacuate/restore operations, labeled by kind and outcome.", &["kind", "outcome"]).unwrap();
    /// Total member-delete operations, labeled by outcome.
    pub static ref MEMBER_DELETES_TOTAL: CounterVec =
        register_counter_vec!("clusterd_member_deletes_total", "Total member delete operations, labeled by outcome.", &["outcome"]).unwrap();
    /// Total placement decisions, labeled by outcome (`placed`, `not_found`).
    pub static ref PLACEMENT_DECISIONS_TOTAL: CounterVec =
        register_counter_vec!("clusterd_placement_decisions_total", "Total placement decisions, labeled by outcome.", &["outcome"]).unwrap();
    /// Total instances force-released by the shutdown orchestrator's busy tracker after the
    /// daemon deadline expired.
    pub static ref SHUTDOWN_FORCE_RELEASED_TOTAL: Counter =
        register_counter!("clusterd_shutdown_force_released_total", "Total instances force-released once the shutdown deadline expired.").unwrap();

    /// Latency of a full evacuation run, from start to the member being marked evacuated.
    pub static ref EVACUATION_DURATION_SECONDS: Histogram =
        register_histogram!("clusterd_evacuation_duration_seconds", "Duration of a full evacuation run in seconds.").unwrap();
    /// Latency of the placement algorithm per instance.
    pub static ref PLACEMENT_DURATION_SECONDS: Histogram =
        register_histogram!("clusterd_placement_duration_seconds", "Duration of a single placement decision in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
