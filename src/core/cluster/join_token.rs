// src/core/cluster/join_token.rs

//! The Join-Token Broker (§4.2, §4.10): issues one-shot, time-bounded join secrets,
//! deduplicated per candidate name, under a single process-wide serialization lock.

use chrono::{Duration, Utc};
use rand::RngCore;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::cluster::ReplicationLayer;
use crate::core::member::{ClusterIdentity, JoinToken, MemberRegistry, RESERVED_NONE_NAME};
use crate::core::metrics::JOIN_TOKENS_TOTAL;
use crate::core::operations::{Operation, OperationClass, OperationRegistry, OperationStatus};
use crate::core::ClusterError;

/// Generates a cryptographically-random hex secret of the given byte length.
fn generate_secret(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// The process-wide join-token serialization lock (§4.10). Held across listing,
/// cancellation of duplicates, secret generation, and operation creation.
pub struct JoinTokenBroker {
    join_token_mu: Mutex<()>,
    operations: Arc<dyn OperationRegistry>,
    replication: Arc<dyn ReplicationLayer>,
    ttl: std::time::Duration,
    secret_bytes: usize,
}

impl JoinTokenBroker {
    pub fn new(
        operations: Arc<dyn OperationRegistry>,
        replication: Arc<dyn ReplicationLayer>,
        ttl: std::time::Duration,
    ) -> Self {
        Self {
            join_token_mu: Mutex::new(()),
            operations,
            replication,
            ttl,
            secret_bytes: 32,
        }
    }

    /// Issues a join token for `candidate_name`, cancelling any existing running token
    /// operation for the same name first. Fails if no online, non-evacuated member
    /// addresses are available to hand to the joiner.
    pub async fn issue(
        &self,
        candidate_name: &str,
        registry: &MemberRegistry,
        identity: &ClusterIdentity,
    ) -> Result<Operation, ClusterError> {
        if candidate_name == RESERVED_NONE_NAME {
            JOIN_TOKENS_TOTAL.with_label_values(&["denied"]).inc();
            return Err(ClusterError::Validation(
                "'none' is a reserved member name".into(),
            ));
        }

        let _guard = self.join_token_mu.lock().await;

        let running = self
            .operations
            .list(Some(OperationClass::Token), None)
            .await?;
        for op in running {
            if op.status != OperationStatus::Running {
                continue;
            }
            let server_name = op
                .metadata
                .get("server_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if server_name == candidate_name {
                self.operations.cancel(op.id).await?;
                JOIN_TOKENS_TOTAL.with_label_values(&["cancelled"]).inc();
            }
        }

        let secret = generate_secret(self.secret_bytes);
        let fingerprint = identity.fingerprint();

        let members = registry.snapshot().await;
        let addresses: Vec<String> = members
            .iter()
            .filter(|m| m.state != crate::core::member::MemberState::Evacuated)
            .map(|m| m.address.clone())
            .collect();
        let online_addresses = self.filter_online(addresses).await?;

        if online_addresses.is_empty() {
            JOIN_TOKENS_TOTAL.with_label_values(&["denied"]).inc();
            return Err(ClusterError::Validation(
                "no online peers are available to hand to the new member".into(),
            ));
        }

        let expires_at = Utc::now() + Duration::from_std(self.ttl).expect("ttl fits in chrono duration");
        let token = JoinToken {
            server_name: candidate_name.to_string(),
            secret,
            cluster_certificate_fingerprint: fingerprint,
            endpoint_addresses: online_addresses,
            expires_at,
        };
        let metadata = serde_json::to_value(&token)?;

        let op = self
            .operations
            .create(OperationClass::Token, candidate_name, metadata)
            .await?;
        JOIN_TOKENS_TOTAL.with_label_values(&["issued"]).inc();
        Ok(op)
    }

    async fn filter_online(&self, addresses: Vec<String>) -> Result<Vec<String>, ClusterError> {
        let nodes = self.replication.nodes().await?;
        let online: std::collections::HashSet<String> = nodes
            .into_iter()
            .filter(|n| n.online)
            .map(|n| n.address)
            .collect();
        Ok(addresses
            .into_iter()
            .filter(|addr| online.contains(addr))
            .collect())
    }

    /// Lazily prunes expired tokens from a listing, per §4.2's "expired tokens are not
    /// served; they are pruned lazily when listed" guarantee.
    pub fn prune_expired(tokens: Vec<Operation>) -> Vec<Operation> {
        let now = Utc::now();
        tokens
            .into_iter()
            .filter(|op| {
                op.metadata
                    .get("expires_at")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok())
                    .map(|expiry| expiry > now)
                    .unwrap_or(true)
            })
            .collect()
    }
}
