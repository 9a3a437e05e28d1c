// src/core/cluster/rebalancer.rs

//! The Rebalancer (§4.7): re-fits replication roles to policy whenever the
//! heartbeat-observed topology changes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::cluster::{ReplicationLayer, ReplicationNode, ReplicationRole};
use crate::core::events::{LifecycleEvent, LifecycleEventEmitter, LifecycleEventKind};
use crate::core::metrics::REBALANCE_PASSES_TOTAL;
use crate::core::ClusterError;

/// Replication-role policy this core tries to maintain.
#[derive(Debug, Clone, Copy)]
pub struct RebalancePolicy {
    pub max_voters: usize,
    pub max_stand_by: usize,
}

/// Re-fits the observed replication topology to `policy`. Runs under the membership
/// mutation lock (passed in by the caller, per the documented lock order
/// `join_token_mu -> membership_mu -> metrics_mu`) and a short settle delay to absorb
/// transient disconnects.
pub struct Rebalancer {
    replication: Arc<dyn ReplicationLayer>,
    settle_delay: Duration,
    events: Arc<dyn LifecycleEventEmitter>,
}

impl Rebalancer {
    pub fn new(
        replication: Arc<dyn ReplicationLayer>,
        settle_delay: Duration,
        events: Arc<dyn LifecycleEventEmitter>,
    ) -> Self {
        Self {
            replication,
            settle_delay,
            events,
        }
    }

    /// Runs one rebalance pass. `is_leader` is checked again after the settle delay;
    /// losing leadership mid-rebalance aborts silently (§4.7 last bullet).
    pub async fn rebalance(
        &self,
        membership_lock: &Mutex<()>,
        policy: RebalancePolicy,
        is_leader: impl Fn() -> bool,
    ) -> Result<(), ClusterError> {
        let nodes = self.replication.nodes().await?;
        if !self.needs_rebalance(&nodes, policy) {
            self.upgrade_unenrolled(&nodes).await?;
            REBALANCE_PASSES_TOTAL.with_label_values(&["no_op"]).inc();
            return Ok(());
        }

        tokio::time::sleep(self.settle_delay).await;

        if !is_leader() {
            REBALANCE_PASSES_TOTAL
                .with_label_values(&["aborted_not_leader"])
                .inc();
            return Ok(());
        }

        let _guard = membership_lock.lock().await;
        if !is_leader() {
            REBALANCE_PASSES_TOTAL
                .with_label_values(&["aborted_not_leader"])
                .inc();
            return Ok(());
        }

        let nodes = self.replication.nodes().await?;
        let plan = self.plan(&nodes, policy);
        if !plan.is_empty() {
            for (address, role) in &plan {
                self.replication.set_replication_role(address, *role).await?;
            }
            let changes: Vec<serde_json::Value> = plan
                .iter()
                .map(|(address, role)| serde_json::json!({"address": address, "role": role.to_string()}))
                .collect();
            self.events.emit(LifecycleEvent {
                kind: LifecycleEventKind::RoleRebalanced,
                location: self.replication.leader_address().await?.unwrap_or_default(),
                detail: serde_json::json!({ "changes": changes }),
            });
            REBALANCE_PASSES_TOTAL.with_label_values(&["applied"]).inc();
        } else {
            REBALANCE_PASSES_TOTAL.with_label_values(&["no_op"]).inc();
        }

        self.upgrade_unenrolled(&nodes).await?;
        Ok(())
    }

    fn needs_rebalance(&self, nodes: &[ReplicationNode], policy: RebalancePolicy) -> bool {
        let voters = nodes
            .iter()
            .filter(|n| n.role == ReplicationRole::Voter)
            .count();
        let stand_by = nodes
            .iter()
            .filter(|n| n.role == ReplicationRole::StandBy)
            .count();
        let any_offline_voter_or_standby = nodes.iter().any(|n| {
            !n.online && matches!(n.role, ReplicationRole::Voter | ReplicationRole::StandBy)
        });
        voters < policy.max_voters || stand_by < policy.max_stand_by || any_offline_voter_or_standby
    }

    /// Builds a demotion/promotion plan: offline voters/stand-bys demote to spare,
    /// then online spares promote to fill the gaps, voters before stand-bys.
    fn plan(
        &self,
        nodes: &[ReplicationNode],
        policy: RebalancePolicy,
    ) -> Vec<(String, ReplicationRole)> {
        let mut plan = Vec::new();
        let mut effective: Vec<ReplicationNode> = nodes.to_vec();

        for node in effective.iter_mut() {
            if !node.online && matches!(node.role, ReplicationRole::Voter | ReplicationRole::StandBy)
            {
                plan.push((node.address.clone(), ReplicationRole::Spare));
                node.role = ReplicationRole::Spare;
            }
        }

        let mut voters = effective
            .iter()
            .filter(|n| n.role == ReplicationRole::Voter)
            .count();
        let mut stand_by = effective
            .iter()
            .filter(|n| n.role == ReplicationRole::StandBy)
            .count();

        for node in effective.iter_mut() {
            if voters >= policy.max_voters {
                break;
            }
            if node.online && node.role == ReplicationRole::Spare {
                plan.push((node.address.clone(), ReplicationRole::Voter));
                node.role = ReplicationRole::Voter;
                voters += 1;
            }
        }

        for node in effective.iter_mut() {
            if stand_by >= policy.max_stand_by {
                break;
            }
            if node.online && node.role == ReplicationRole::Spare {
                plan.push((node.address.clone(), ReplicationRole::StandBy));
                node.role = ReplicationRole::StandBy;
                stand_by += 1;
            }
        }

        plan
    }

    /// Enrolls nodes not yet part of the replicated set, identified by
    /// `replication_id == 0`, on a separate pass (§4.7): each is given a baseline
    /// `spare` role so the next rebalance pass can promote it like any other node.
    async fn upgrade_unenrolled(&self, nodes: &[ReplicationNode]) -> Result<(), ClusterError> {
        for node in nodes {
            if node.replication_id == 0 {
                self.replication
                    .set_replication_role(&node.address, ReplicationRole::Spare)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cluster::InMemoryReplicationLayer;
    use crate::core::events::BroadcastLifecycleEventEmitter;

    #[tokio::test]
    async fn promotes_spare_when_voters_below_policy() {
        let layer = InMemoryReplicationLayer::new("n1");
        layer.insert_node(ReplicationNode {
            address: "n2".to_string(),
            role: ReplicationRole::Spare,
            online: true,
            replication_id: 1,
        });

        let rebalancer = Rebalancer::new(
            layer.clone(),
            Duration::from_millis(1),
            Arc::new(BroadcastLifecycleEventEmitter::new()),
        );
        let lock = Mutex::new(());
        rebalancer
            .rebalance(
                &lock,
                RebalancePolicy {
                    max_voters: 2,
                    max_stand_by: 0,
                },
                || true,
            )
            .await
            .unwrap();

        let nodes = layer.nodes().await.unwrap();
        let n2 = nodes.iter().find(|n| n.address == "n2").unwrap();
        assert_eq!(n2.role, ReplicationRole::Voter);
    }

    #[tokio::test]
    async fn aborts_silently_on_lost_leadership() {
        let layer = InMemoryReplicationLayer::new("n1");
        layer.insert_node(ReplicationNode {
            address: "n2".to_string(),
            role: ReplicationRole::Spare,
            online: true,
            replication_id: 1,
        });
        let rebalancer = Rebalancer::new(
            layer.clone(),
            Duration::from_millis(1),
            Arc::new(BroadcastLifecycleEventEmitter::new()),
        );
        let lock = Mutex::new(());
        rebalancer
            .rebalance(
                &lock,
                RebalancePolicy {
                    max_voters: 2,
                    max_stand_by: 0,
                },
                || false,
            )
            .await
            .unwrap();

        let nodes = layer.nodes().await.unwrap();
        let n2 = nodes.iter().find(|n| n.address == "n2").unwrap();
        assert_eq!(n2.role, ReplicationRole::Spare);
    }

    #[tokio::test]
    async fn unenrolled_node_is_upgraded_to_spare() {
        let layer = InMemoryReplicationLayer::new("n1");
        layer.insert_node(ReplicationNode {
            address: "n2".to_string(),
            role: ReplicationRole::None,
            online: true,
            replication_id: 0,
        });

        let rebalancer = Rebalancer::new(
            layer.clone(),
            Duration::from_millis(1),
            Arc::new(BroadcastLifecycleEventEmitter::new()),
        );
        let lock = Mutex::new(());
        rebalancer
            .rebalance(
                &lock,
                RebalancePolicy {
                    max_voters: 1,
                    max_stand_by: 0,
                },
                || true,
            )
            .await
            .unwrap();

        let nodes = layer.nodes().await.unwrap();
        let n2 = nodes.iter().find(|n| n.address == "n2").unwrap();
        assert_eq!(n2.role, ReplicationRole::Spare);
    }
}
