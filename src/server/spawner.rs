// src/server/spawner.rs

//! Spawns the daemon's long-lived background tasks into a `JoinSet`, each subscribed
//! to the shutdown broadcast so a single signal tears all of them down together.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::core::cluster::RebalancePolicy;
use crate::core::state::ClusterDaemonState;
use crate::core::tasks::run_heartbeat_rebalance_loop;

/// Spawns every background task this daemon runs for its lifetime, returning their
/// handles so the caller can await them during shutdown.
pub fn spawn_all(
    state: Arc<ClusterDaemonState>,
    shutdown: broadcast::Receiver<()>,
) -> Vec<JoinHandle<()>> {
    let policy = RebalancePolicy {
        max_voters: state.config.cluster.max_voters,
        max_stand_by: state.config.cluster.max_stand_by,
    };

    let rebalance_handle = tokio::spawn(run_heartbeat_rebalance_loop(state, policy, shutdown));

    vec![rebalance_handle]
}
