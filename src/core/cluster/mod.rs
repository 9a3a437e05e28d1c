// src/core/cluster/mod.rs

//! Cluster-membership coordinators: routing, join tokens, rebalancing, placement,
//! evacuation/restoration, member delete, the shutdown orchestrator, and the metrics
//! cache that feeds the evacuation path's observability.

pub mod delete;
pub mod evacuation;
pub mod instance;
pub mod join_token;
pub mod metrics_cache;
pub mod placement;
pub mod rebalancer;
pub mod reverter;
pub mod router;
pub mod shutdown;

pub use crate::core::replication::{
    Heartbeat, InMemoryReplicationLayer, ReplicationLayer, ReplicationNode, ReplicationRole,
};

pub use delete::{ImageSyncAndIdentity, MemberDelete, NoopImageSyncAndIdentity};
pub use evacuation::{EvacuationCoordinator, EvacuationLocks, SnapshotLoadView};
pub use instance::{
    EvacuateAction, EvacuateMode, InMemoryInstanceRuntime, Instance, InstanceRuntime, RestoreMode,
};
pub use join_token::JoinTokenBroker;
pub use metrics_cache::{MetricSource, MetricsCache, ProjectMetrics};
pub use placement::{place_instance, LoadView, PlacementGroupCache, PlacementGroupResolver};
pub use rebalancer::{RebalancePolicy, Rebalancer};
pub use reverter::Reverter;
pub use router::{route, RouteDecision, SelfRemovalLocks};
pub use shutdown::{BusyOperations, ShutdownOrchestrator};
