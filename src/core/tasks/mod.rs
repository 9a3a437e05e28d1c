// src/core/tasks/mod.rs

//! Background tasks: the heartbeat-driven rebalance loop. Spawned once at startup and
//! run for the process lifetime, mirroring the teacher's own "spawn a JoinSet of
//! long-lived loops, subscribe each to the shutdown broadcast" shape.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::core::errors::log_and_drop;
use crate::core::state::ClusterDaemonState;

/// Runs the Rebalancer on every heartbeat tick until `shutdown` fires (§4.7: "Invoked
/// after membership mutations and on every heartbeat").
pub async fn run_heartbeat_rebalance_loop(
    state: Arc<ClusterDaemonState>,
    policy: crate::core::cluster::RebalancePolicy,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut heartbeats = state.replication.subscribe_heartbeats();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("heartbeat rebalance loop shutting down");
                return;
            }
            tick = heartbeats.recv() => {
                match tick {
                    Ok(_) => {
                        let was_leader = state.is_leader().await;
                        let result = state
                            .rebalancer
                            .rebalance(&state.membership_mu, policy, || was_leader)
                            .await;
                        log_and_drop("rebalance pass failed", result);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "heartbeat rebalance loop lagged, continuing");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("heartbeat channel closed, stopping rebalance loop");
                        return;
                    }
                }
            }
        }
    }
}
