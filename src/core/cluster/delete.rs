// src/core/cluster/delete.rs

//! Member Delete (§4.4): the ten-step leader-enacted removal sequence.

use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::core::cluster::rebalancer::{Rebalancer, RebalancePolicy};
use crate::core::cluster::{ReplicationLayer, ReplicationRole};
use crate::core::errors::log_and_drop;
use crate::core::events::{LifecycleEvent, LifecycleEventEmitter, LifecycleEventKind};
use crate::core::member::MemberRegistry;
use crate::core::metrics::MEMBER_DELETES_TOTAL;
use crate::core::ClusterError;

/// External collaborators Member Delete calls out to beyond the registry and
/// replication layer; each corresponds to one numbered step in §4.4.
#[async_trait::async_trait]
pub trait ImageSyncAndIdentity: Send + Sync {
    /// Step 3: best-effort image sync across the cluster.
    async fn sync_images_cluster_wide(&self) -> Result<(), ClusterError>;
    /// Step 5: per-project network/storage cleanup on the departing member.
    async fn delete_networks_and_storage(&self, departing_address: &str) -> Result<(), ClusterError>;
    /// Step 8: disables clustering on the local node.
    async fn disable_clustering_locally(&self) -> Result<(), ClusterError>;
    /// Step 9: tells the departing member to reset itself to standalone.
    async fn reset_member_to_standalone(&self, departing_address: &str) -> Result<(), ClusterError>;
    /// Step 10: refresh the identity cache and re-sync images.
    async fn refresh_identity_and_resync(&self) -> Result<(), ClusterError>;
}

pub struct MemberDelete {
    registry: Arc<MemberRegistry>,
    replication: Arc<dyn ReplicationLayer>,
    rebalancer: Arc<Rebalancer>,
    collaborator: Arc<dyn ImageSyncAndIdentity>,
    membership_lock: Arc<AsyncMutex<()>>,
    local_member_name: String,
    events: Arc<dyn LifecycleEventEmitter>,
}

impl MemberDelete {
    pub fn new(
        registry: Arc<MemberRegistry>,
        replication: Arc<dyn ReplicationLayer>,
        rebalancer: Arc<Rebalancer>,
        collaborator: Arc<dyn ImageSyncAndIdentity>,
        membership_lock: Arc<AsyncMutex<()>>,
        local_member_name: String,
        events: Arc<dyn LifecycleEventEmitter>,
    ) -> Self {
        Self {
            registry,
            replication,
            rebalancer,
            collaborator,
            membership_lock,
            local_member_name,
            events,
        }
    }

    /// Runs the full delete sequence on `target_name`. Must only be called on the
    /// leader (routing is the Leader Router's responsibility, §4.1/§4.4).
    pub async fn delete(&self, target_name: &str, force: bool) -> Result<(), ClusterError> {
        let result = self.delete_inner(target_name, force).await;
        MEMBER_DELETES_TOTAL
            .with_label_values(&[if result.is_ok() { "success" } else { "failure" }])
            .inc();
        result
    }

    async fn delete_inner(&self, target_name: &str, force: bool) -> Result<(), ClusterError> {
        let _membership_guard = self.membership_lock.lock().await;

        let target = self
            .registry
            .get_by_name(target_name)
            .await
            .ok_or_else(|| ClusterError::NotFound(format!("member '{target_name}' not found")))?;

        // Step 2: two-member-cluster leader removal promotes the survivor and waits.
        let all_members = self.registry.snapshot().await;
        if all_members.len() == 2 {
            let leader_address = self.replication.leader_address().await?;
            if leader_address.as_deref() == Some(target.address.as_str()) {
                let survivor = all_members
                    .iter()
                    .find(|m| m.name != target_name)
                    .expect("exactly one other member in a two-member cluster");
                self.replication
                    .set_replication_role(&survivor.address, ReplicationRole::Voter)
                    .await?;
                self.wait_for_leadership(&survivor.address).await?;
            }
        }

        // Step 3: best-effort image sync; fatal unless force.
        if let Err(e) = self.collaborator.sync_images_cluster_wide().await {
            if !force {
                return Err(e);
            }
            log_and_drop("image sync failed under force, continuing", Err(e));
        }

        // Step 4: replication-level leave.
        self.replication.remove_node(&target.address).await?;

        // Step 5: best-effort network/storage cleanup, unless force skips it entirely.
        if !force {
            if let Err(e) = self
                .collaborator
                .delete_networks_and_storage(&target.address)
                .await
            {
                return Err(e);
            }
        }

        // Step 6: purge the member row.
        self.registry
            .transaction(|txn| txn.remove_by_name(target_name))
            .await?;

        self.events.emit(LifecycleEvent {
            kind: LifecycleEventKind::MemberDeleted,
            location: target_name.to_string(),
            detail: serde_json::json!({"force": force}),
        });

        // Step 7: re-run the Rebalancer.
        let nodes_after = self.replication.nodes().await?;
        let voters = nodes_after
            .iter()
            .filter(|n| n.role == ReplicationRole::Voter)
            .count();
        let _ = self
            .rebalancer
            .rebalance(
                &self.membership_lock,
                RebalancePolicy {
                    max_voters: voters.max(1),
                    max_stand_by: 0,
                },
                || true,
            )
            .await;

        // Step 8: if the deleted member is local, disable clustering and return.
        if target_name == self.local_member_name {
            self.collaborator.disable_clustering_locally().await?;
            return Ok(());
        }

        // Step 9: best-effort reset of the departing member to standalone.
        if !force {
            log_and_drop(
                "failed to reset departing member to standalone",
                self.collaborator
                    .reset_member_to_standalone(&target.address)
                    .await,
            );
        }

        // Step 10: refresh identity cache and re-sync images.
        self.collaborator.refresh_identity_and_resync().await?;

        Ok(())
    }

    async fn wait_for_leadership(&self, address: &str) -> Result<(), ClusterError> {
        for _ in 0..600 {
            if self.replication.leader_address().await?.as_deref() == Some(address) {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        Err(ClusterError::Transient(format!(
            "timed out waiting for '{address}' to attain leadership"
        )))
    }
}

/// A no-op `ImageSyncAndIdentity` used where no real image/network backend is wired
/// in. Every step it covers is a best-effort side channel outside this core's scope.
#[derive(Default)]
pub struct NoopImageSyncAndIdentity;

#[async_trait::async_trait]
impl ImageSyncAndIdentity for NoopImageSyncAndIdentity {
    async fn sync_images_cluster_wide(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn delete_networks_and_storage(&self, _departing_address: &str) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn disable_clustering_locally(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn reset_member_to_standalone(&self, _departing_address: &str) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn refresh_identity_and_resync(&self) -> Result<(), ClusterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cluster::InMemoryReplicationLayer;
    use crate::core::events::BroadcastLifecycleEventEmitter;
    use crate::core::member::Member;
    use crate::core::member::MemberState;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    struct NoopCollaborator;

    #[async_trait::async_trait]
    impl ImageSyncAndIdentity for NoopCollaborator {
        async fn sync_images_cluster_wide(&self) -> Result<(), ClusterError> {
            Ok(())
        }
        async fn delete_networks_and_storage(&self, _departing_address: &str) -> Result<(), ClusterError> {
            Ok(())
        }
        async fn disable_clustering_locally(&self) -> Result<(), ClusterError> {
            Ok(())
        }
        async fn reset_member_to_standalone(&self, _departing_address: &str) -> Result<(), ClusterError> {
            Ok(())
        }
        async fn refresh_identity_and_resync(&self) -> Result<(), ClusterError> {
            Ok(())
        }
    }

    fn member(name: &str, addr: &str) -> Member {
        Member {
            id: Uuid::new_v4(),
            name: name.to_string(),
            address: addr.to_string(),
            state: MemberState::Created,
            roles: Default::default(),
            groups: ["default".to_string()].into(),
            failure_domain: None,
            architecture: 1,
            config: BTreeMap::new(),
            description: String::new(),
            last_seen_unix_ms: 0,
        }
    }

    #[tokio::test]
    async fn two_node_leader_delete_promotes_survivor_and_purges_leader() {
        let registry = Arc::new(MemberRegistry::new(member("leader", "10.0.0.1:8443")));
        registry
            .transaction(|txn| txn.insert(member("follower", "10.0.0.2:8443")))
            .await
            .unwrap();

        let replication = InMemoryReplicationLayer::new("10.0.0.1:8443");
        replication.insert_node(crate::core::cluster::ReplicationNode {
            address: "10.0.0.2:8443".to_string(),
            role: ReplicationRole::StandBy,
            online: true,
            replication_id: 1,
        });
        replication.set_leader(Some("10.0.0.1:8443".to_string()));

        // Simulate the replication layer electing the promoted survivor once it
        // becomes a voter, the way a real consensus backend would.
        let replication_for_election = replication.clone();
        tokio::spawn(async move {
            loop {
                let nodes = replication_for_election.nodes().await.unwrap();
                if let Some(follower) = nodes.iter().find(|n| n.address == "10.0.0.2:8443") {
                    if follower.role == ReplicationRole::Voter {
                        replication_for_election.set_leader(Some("10.0.0.2:8443".to_string()));
                        return;
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });

        let rebalancer = Arc::new(Rebalancer::new(
            replication.clone(),
            std::time::Duration::from_millis(1),
            Arc::new(BroadcastLifecycleEventEmitter::new()),
        ));
        let membership_lock = Arc::new(AsyncMutex::new(()));
        let delete = MemberDelete::new(
            registry.clone(),
            replication.clone(),
            rebalancer,
            Arc::new(NoopCollaborator),
            membership_lock,
            "follower".to_string(),
            Arc::new(BroadcastLifecycleEventEmitter::new()),
        );

        delete.delete("leader", false).await.unwrap();

        assert!(registry.get_by_name("leader").await.is_none());
        assert_eq!(registry.len().await, 1);
    }
}
