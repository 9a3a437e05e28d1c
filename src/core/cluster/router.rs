// src/core/cluster/router.rs

//! The Leader Router (§4.1): decides, for every membership-mutating or named-member
//! request, whether to serve locally, forward to the named member, or forward to the
//! leader.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::core::ClusterError;

/// The router's deterministic decision, given a transactional snapshot of addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    ServeLocally,
    ForwardToNamed { address: String },
    ForwardToLeader { address: String },
}

/// Resolves one of the three routing outcomes. Pure and deterministic given the
/// snapshot: two concurrent routers reading the same `(local_address, leader_address,
/// subject_address)` triple must agree (§4.1).
pub fn route(
    local_address: &str,
    leader_address: Option<&str>,
    subject_address: Option<&str>,
) -> Result<RouteDecision, ClusterError> {
    let leader_address = leader_address.ok_or(ClusterError::NotClustered)?;

    if let Some(subject_address) = subject_address {
        if subject_address == local_address {
            return Ok(RouteDecision::ServeLocally);
        }
        if leader_address == local_address {
            return Ok(RouteDecision::ServeLocally);
        }
        return Ok(RouteDecision::ForwardToNamed {
            address: subject_address.to_string(),
        });
    }

    if leader_address == local_address {
        return Ok(RouteDecision::ServeLocally);
    }
    Ok(RouteDecision::ForwardToLeader {
        address: leader_address.to_string(),
    })
}

/// Per-member self-removal locks (§4.1): taken before forwarding a delete of the local
/// member, so the leader's eventual "disable clustering on yourself" callback is queued
/// until the original response has been flushed.
#[derive(Default)]
pub struct SelfRemovalLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SelfRemovalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, member_name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(member_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquires the self-removal lock for `member_name`. The guard is owned so it can
    /// be held across the life of the originating request context and released only
    /// when that context ends.
    pub async fn acquire(&self, member_name: &str) -> OwnedMutexGuard<()> {
        let lock = self.lock_for(member_name);
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_locally_when_local_is_leader_and_no_subject() {
        let decision = route("n1", Some("n1"), None).unwrap();
        assert_eq!(decision, RouteDecision::ServeLocally);
    }

    #[test]
    fn forwards_to_leader_when_not_leader_and_no_subject() {
        let decision = route("n1", Some("n2"), None).unwrap();
        assert_eq!(
            decision,
            RouteDecision::ForwardToLeader {
                address: "n2".to_string()
            }
        );
    }

    #[test]
    fn forwards_to_named_subject_when_neither_local_nor_leader() {
        let decision = route("n1", Some("n2"), Some("n3")).unwrap();
        assert_eq!(
            decision,
            RouteDecision::ForwardToNamed {
                address: "n3".to_string()
            }
        );
    }

    #[test]
    fn serves_locally_when_subject_is_local() {
        let decision = route("n1", Some("n2"), Some("n1")).unwrap();
        assert_eq!(decision, RouteDecision::ServeLocally);
    }

    #[test]
    fn not_clustered_when_no_leader() {
        assert!(matches!(
            route("n1", None, None),
            Err(ClusterError::NotClustered)
        ));
    }

    #[tokio::test]
    async fn self_removal_lock_serializes_per_member() {
        let locks = SelfRemovalLocks::new();
        let guard = locks.acquire("n1").await;
        drop(guard);
        let _guard2 = locks.acquire("n1").await;
    }
}
