// src/server/initialization.rs

//! Builds the process-wide `ClusterDaemonState` from a validated `Config`: loads the
//! TLS identity, wires the in-memory reference collaborators, and assembles the locks
//! and caches the lock-ordering discipline in §9 depends on.

use anyhow::{anyhow, Result};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::rustls;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::core::cluster::{
    placement, EvacuationCoordinator, EvacuationLocks, ImageSyncAndIdentity,
    InMemoryInstanceRuntime, InMemoryReplicationLayer, InstanceRuntime, JoinTokenBroker,
    MemberDelete, MetricsCache, NoopImageSyncAndIdentity, Rebalancer, SelfRemovalLocks,
    ShutdownOrchestrator, SnapshotLoadView,
};
use crate::core::events::{BroadcastLifecycleEventEmitter, LifecycleEventEmitter};
use crate::core::member::{ClusterIdentity, Member, MemberRegistry, MemberState, RESERVED_NONE_NAME};
use crate::core::operations::InMemoryOperationRegistry;
use crate::core::state::ClusterDaemonState;

/// Builds the complete daemon state described in `config`.
pub async fn setup(config: Config) -> Result<Arc<ClusterDaemonState>> {
    let identity = load_or_self_sign_identity(&config)?;
    let local_member_name = config.cluster.announce_address.clone();

    let local_member = Member {
        id: Uuid::new_v4(),
        name: local_member_name.clone(),
        address: config.cluster.announce_address.clone(),
        state: MemberState::Created,
        roles: Default::default(),
        groups: ["default".to_string()].into(),
        failure_domain: None,
        architecture: 1,
        config: Default::default(),
        description: String::new(),
        last_seen_unix_ms: 0,
    };
    if local_member.name == RESERVED_NONE_NAME {
        anyhow::bail!("'{RESERVED_NONE_NAME}' cannot be used as this node's announce address");
    }

    let registry = Arc::new(MemberRegistry::new(local_member));
    let operations: Arc<dyn crate::core::operations::OperationRegistry> = InMemoryOperationRegistry::new();
    let replication: Arc<dyn crate::core::cluster::ReplicationLayer> =
        InMemoryReplicationLayer::new(&config.cluster.announce_address);
    let instance_runtime: Arc<dyn InstanceRuntime> = InMemoryInstanceRuntime::new();
    let placement_resolver = placement::shared_noop_resolver();
    let events: Arc<dyn LifecycleEventEmitter> = Arc::new(BroadcastLifecycleEventEmitter::new());

    let join_token_broker = Arc::new(JoinTokenBroker::new(
        operations.clone(),
        replication.clone(),
        config.cluster.join_token_ttl,
    ));
    let membership_mu = Arc::new(AsyncMutex::new(()));
    let metrics_cache = Arc::new(MetricsCache::new());

    let evacuation_locks = Arc::new(EvacuationLocks::new());
    let members_snapshot = registry.snapshot().await;
    let load: Arc<dyn crate::core::cluster::LoadView + Send + Sync> =
        Arc::new(SnapshotLoadView::from_members(&members_snapshot, &[]));
    let evacuation = Arc::new(EvacuationCoordinator::new(
        registry.clone(),
        instance_runtime.clone(),
        operations.clone(),
        evacuation_locks.clone(),
        placement_resolver.clone(),
        load,
        config.cluster.offline_threshold,
        events.clone(),
    ));

    let rebalancer = Arc::new(Rebalancer::new(
        replication.clone(),
        config.cluster.rebalance_settle_delay,
        events.clone(),
    ));

    let collaborator: Arc<dyn ImageSyncAndIdentity> = Arc::new(NoopImageSyncAndIdentity);
    let member_delete = Arc::new(MemberDelete::new(
        registry.clone(),
        replication.clone(),
        rebalancer.clone(),
        collaborator,
        membership_mu.clone(),
        local_member_name.clone(),
        events.clone(),
    ));

    let self_removal_locks = Arc::new(SelfRemovalLocks::new());

    let shutdown_orchestrator = Arc::new(ShutdownOrchestrator::new(
        instance_runtime.clone(),
        config.shutdown.per_instance_timeout,
        config.shutdown.daemon_deadline,
    ));

    info!(announce_address = %config.cluster.announce_address, clustering_enabled = config.cluster.enabled, "daemon state assembled");

    Ok(Arc::new(ClusterDaemonState {
        config,
        local_member_name,
        identity,
        registry,
        operations,
        replication,
        instance_runtime,
        placement_resolver,
        events,
        join_token_broker,
        membership_mu,
        metrics_cache,
        evacuation,
        evacuation_locks,
        rebalancer,
        member_delete,
        self_removal_locks,
        shutdown_orchestrator,
    }))
}

/// Loads the cluster's TLS certificate from disk, or synthesizes a placeholder
/// identity when TLS is disabled. Certificate issuance is out of scope for this core;
/// only the fingerprint derived from it matters here.
fn load_or_self_sign_identity(config: &Config) -> Result<ClusterIdentity> {
    if config.tls.enabled {
        let certs = load_certs(&config.tls.cert_path)?;
        let leaf = certs
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no certificates found in '{}'", config.tls.cert_path))?;
        Ok(ClusterIdentity {
            certificate_der: leaf.as_ref().to_vec(),
        })
    } else {
        Ok(ClusterIdentity {
            certificate_der: Vec::new(),
        })
    }
}

/// Loads PEM-encoded certificates from disk, the way a TLS-terminating listener would
/// before handing them to `rustls::ServerConfig::with_single_cert`.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file =
        File::open(path).map_err(|e| anyhow!("failed to open certificate file '{path}': {e}"))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in '{path}'"));
    }
    Ok(certs)
}
