// src/core/replication/mod.rs

//! The Replication Layer: the external collaborator this core delegates cluster
//! consensus and heartbeat delivery to. Production deployments back this with the
//! embedded replicated database's own membership primitives; the in-memory
//! implementation here exists for tests and local development.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast;

use crate::core::ClusterError;

/// The replication role a member plays in the underlying consensus group, per §3/§4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReplicationRole {
    Voter,
    StandBy,
    Spare,
    None,
}

impl ReplicationRole {
    pub fn parse(s: &str) -> Option<Self> {
        Self::from_str(s).ok()
    }
}

/// A snapshot of one node as seen by the replication layer — not the Member Registry's
/// record, but the consensus group's own view (address, role, online-ness).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationNode {
    pub address: String,
    pub role: ReplicationRole,
    pub online: bool,
    /// 0 if this node has not yet been enrolled into the replicated set. The Rebalancer's
    /// unenrolled-node pass looks for exactly this value.
    pub replication_id: u64,
}

/// A heartbeat tick, broadcast to every subscriber interested in re-evaluating
/// membership (the Rebalancer, the offline-threshold checker).
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub unix_ms: i64,
}

/// The external interface onto the replicated database's cluster-consensus facilities.
/// All methods are RPC-shaped (fallible, async) because a production implementation
/// talks to the embedded database over its own client protocol.
#[async_trait]
pub trait ReplicationLayer: Send + Sync {
    /// The address of the current consensus leader, or `None` if no leader is elected
    /// (e.g. quorum lost).
    async fn leader_address(&self) -> Result<Option<String>, ClusterError>;

    /// Every node known to the consensus group, independent of the Member Registry.
    async fn nodes(&self) -> Result<Vec<ReplicationNode>, ClusterError>;

    /// Requests a replication-role change for the named node. Idempotent: setting a
    /// role a node already holds is a no-op success.
    async fn set_replication_role(
        &self,
        address: &str,
        role: ReplicationRole,
    ) -> Result<(), ClusterError>;

    /// Removes a node from the consensus group entirely (used by Member Delete, §4.4).
    async fn remove_node(&self, address: &str) -> Result<(), ClusterError>;

    /// Subscribes to heartbeat ticks. Each tick is an opportunity to re-evaluate
    /// offline thresholds and to trigger a Rebalancer pass.
    fn subscribe_heartbeats(&self) -> broadcast::Receiver<Heartbeat>;
}

/// A reference implementation backed by an in-process map, for tests and for running
/// this core stand-alone without a real consensus backend.
pub struct InMemoryReplicationLayer {
    nodes: DashMap<String, ReplicationNode>,
    leader: parking_lot::RwLock<Option<String>>,
    heartbeat_tx: broadcast::Sender<Heartbeat>,
}

impl InMemoryReplicationLayer {
    pub fn new(local_address: &str) -> Arc<Self> {
        let nodes = DashMap::new();
        nodes.insert(
            local_address.to_string(),
            ReplicationNode {
                address: local_address.to_string(),
                role: ReplicationRole::Voter,
                online: true,
                replication_id: 1,
            },
        );
        let (heartbeat_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            nodes,
            leader: parking_lot::RwLock::new(Some(local_address.to_string())),
            heartbeat_tx,
        })
    }

    pub fn insert_node(&self, node: ReplicationNode) {
        self.nodes.insert(node.address.clone(), node);
    }

    pub fn emit_heartbeat(&self, unix_ms: i64) {
        let _ = self.heartbeat_tx.send(Heartbeat { unix_ms });
    }

    pub fn set_leader(&self, address: Option<String>) {
        *self.leader.write() = address;
    }
}

#[async_trait]
impl ReplicationLayer for InMemoryReplicationLayer {
    async fn leader_address(&self) -> Result<Option<String>, ClusterError> {
        Ok(self.leader.read().clone())
    }

    async fn nodes(&self) -> Result<Vec<ReplicationNode>, ClusterError> {
        Ok(self.nodes.iter().map(|e| e.value().clone()).collect())
    }

    async fn set_replication_role(
        &self,
        address: &str,
        role: ReplicationRole,
    ) -> Result<(), ClusterError> {
        let mut entry = self.nodes.get_mut(address).ok_or_else(|| {
            ClusterError::NotFound(format!("no replication node at '{address}'"))
        })?;
        entry.role = role;
        Ok(())
    }

    async fn remove_node(&self, address: &str) -> Result<(), ClusterError> {
        self.nodes.remove(address);
        if self.leader.read().as_deref() == Some(address) {
            *self.leader.write() = None;
        }
        Ok(())
    }

    fn subscribe_heartbeats(&self) -> broadcast::Receiver<Heartbeat> {
        self.heartbeat_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_role_is_reflected_in_nodes() {
        let layer = InMemoryReplicationLayer::new("10.0.0.1:8443");
        layer
            .set_replication_role("10.0.0.1:8443", ReplicationRole::StandBy)
            .await
            .unwrap();
        let nodes = layer.nodes().await.unwrap();
        assert_eq!(nodes[0].role, ReplicationRole::StandBy);
    }

    #[tokio::test]
    async fn removing_the_leader_clears_leadership() {
        let layer = InMemoryReplicationLayer::new("10.0.0.1:8443");
        layer.remove_node("10.0.0.1:8443").await.unwrap();
        assert_eq!(layer.leader_address().await.unwrap(), None);
    }
}
