// src/core/state.rs

//! `ClusterDaemonState`: the process-wide shared state every handler and background
//! task is built against, analogous to a conventional server's top-level state struct.

use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::Config;
use crate::core::cluster::{
    EvacuationCoordinator, EvacuationLocks, InstanceRuntime, JoinTokenBroker, MemberDelete,
    MetricsCache, PlacementGroupResolver, Rebalancer, ReplicationLayer, SelfRemovalLocks,
    ShutdownOrchestrator,
};
use crate::core::events::LifecycleEventEmitter;
use crate::core::member::{ClusterIdentity, MemberRegistry};
use crate::core::operations::OperationRegistry;

/// Everything a request handler or background task needs, grouped the way the
/// lock-ordering discipline in §9 expects: `join_token_mu -> membership_mu ->
/// metrics_mu`, never nested in reverse.
pub struct ClusterDaemonState {
    pub config: Config,
    pub local_member_name: String,
    pub identity: ClusterIdentity,

    pub registry: Arc<MemberRegistry>,
    pub operations: Arc<dyn OperationRegistry>,
    pub replication: Arc<dyn ReplicationLayer>,
    pub instance_runtime: Arc<dyn InstanceRuntime>,
    pub placement_resolver: Arc<dyn PlacementGroupResolver>,
    pub events: Arc<dyn LifecycleEventEmitter>,

    /// Serializes token issuance (§4.10); acquired before `membership_mu`.
    pub join_token_broker: Arc<JoinTokenBroker>,
    /// Serializes all membership mutations on the leader (§5).
    pub membership_mu: Arc<AsyncMutex<()>>,
    /// Per-project metrics cache; acquired only around map writes (§5).
    pub metrics_cache: Arc<MetricsCache>,

    pub evacuation: Arc<EvacuationCoordinator>,
    pub evacuation_locks: Arc<EvacuationLocks>,
    pub rebalancer: Arc<Rebalancer>,
    pub member_delete: Arc<MemberDelete>,
    pub self_removal_locks: Arc<SelfRemovalLocks>,
    /// Drains local instances on process shutdown (§4.9); invoked once by the
    /// listener loop on receipt of a termination signal.
    pub shutdown_orchestrator: Arc<ShutdownOrchestrator>,
}

impl ClusterDaemonState {
    /// Reports whether this node is currently the leader, per the Replication Layer.
    pub async fn is_leader(&self) -> bool {
        match self.replication.leader_address().await {
            Ok(Some(leader)) => {
                self.registry
                    .get_by_name(&self.local_member_name)
                    .await
                    .map(|m| m.address == leader)
                    .unwrap_or(false)
            }
            _ => false,
        }
    }

    pub async fn leader_address(&self) -> Option<String> {
        self.replication.leader_address().await.ok().flatten()
    }

    pub async fn local_address(&self) -> Option<String> {
        self.registry
            .get_by_name(&self.local_member_name)
            .await
            .map(|m| m.address)
    }
}
