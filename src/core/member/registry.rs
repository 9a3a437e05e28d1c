// src/core/member/registry.rs

//! The Member Registry: the persisted set of cluster members. The spec treats the
//! underlying replicated database as an opaque transactional key/value store (§1); this
//! module models exactly that boundary with an in-process, lock-guarded table. All
//! mutations run inside `transaction`, so two concurrent callers can never observe a
//! torn read of the member set.

use super::model::{Member, MemberState};
use crate::core::ClusterError;
use indexmap::IndexMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A mutable view of the registry handed to the closure passed to `transaction`. All
/// reads and writes a caller performs through this handle are serialized with every
/// other transaction.
pub struct RegistryTxn<'a> {
    members: &'a mut IndexMap<Uuid, Member>,
}

impl<'a> RegistryTxn<'a> {
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Member> {
        self.members.values().find(|m| m.name == name)
    }

    pub fn get_by_name_mut(&mut self, name: &str) -> Option<&mut Member> {
        self.members.values_mut().find(|m| m.name == name)
    }

    pub fn get_by_address(&self, address: &str) -> Option<&Member> {
        self.members.values().find(|m| m.address == address)
    }

    /// Inserts a brand-new member row, enforcing the name/address uniqueness invariant.
    pub fn insert(&mut self, member: Member) -> Result<(), ClusterError> {
        if member.name == super::model::RESERVED_NONE_NAME {
            return Err(ClusterError::Validation(
                "member name 'none' is reserved".into(),
            ));
        }
        if self.get_by_name(&member.name).is_some() {
            return Err(ClusterError::Conflict(format!(
                "a member named '{}' already exists",
                member.name
            )));
        }
        if self.get_by_address(&member.address).is_some() {
            return Err(ClusterError::Conflict(format!(
                "a member with address '{}' already exists",
                member.address
            )));
        }
        if member.groups.is_empty() {
            return Err(ClusterError::Validation(
                "groups must be non-empty".into(),
            ));
        }
        self.members.insert(member.id, member);
        Ok(())
    }

    pub fn remove_by_name(&mut self, name: &str) -> Result<Member, ClusterError> {
        let id = self
            .get_by_name(name)
            .map(|m| m.id)
            .ok_or_else(|| ClusterError::NotFound(format!("member '{name}' not found")))?;
        Ok(self.members.shift_remove(&id).expect("id just looked up"))
    }

    /// Enacts a state transition per the Member.state machine (§3). Rejects
    /// `pending -> evacuated/created-via-restore` attempts and no-op transitions.
    pub fn transition_state(
        &mut self,
        name: &str,
        to: MemberState,
    ) -> Result<MemberState, ClusterError> {
        let member = self
            .get_by_name_mut(name)
            .ok_or_else(|| ClusterError::NotFound(format!("member '{name}' not found")))?;

        if member.state == MemberState::Pending {
            return Err(ClusterError::Precondition(format!(
                "member '{name}' is still pending and cannot be evacuated or restored"
            )));
        }

        if member.state == to {
            let verb = match to {
                MemberState::Evacuated => "evacuate",
                MemberState::Created => "restore",
                MemberState::Pending => "join",
            };
            return Err(ClusterError::Precondition(format!(
                "cannot {verb} member '{name}': it is already in that state"
            )));
        }

        let previous = member.state;
        member.state = to;
        Ok(previous)
    }
}

#[derive(Debug)]
struct RegistryInner {
    members: IndexMap<Uuid, Member>,
}

/// The Member Registry. Holds the transactional, persisted set of cluster members.
#[derive(Debug)]
pub struct MemberRegistry {
    inner: Mutex<RegistryInner>,
}

impl MemberRegistry {
    /// Creates a registry seeded with the local member (the node running this process),
    /// matching the invariant that exactly one member has `name == "local"`'s referent.
    pub fn new(local_member: Member) -> Self {
        let mut members = IndexMap::new();
        members.insert(local_member.id, local_member);
        Self {
            inner: Mutex::new(RegistryInner { members }),
        }
    }

    /// Runs `f` against a consistent, exclusive view of the registry. This is the only
    /// way to mutate members; it is also the recommended way to perform multi-step reads
    /// that must not race with a concurrent writer (e.g. the Placement Engine's
    /// candidate snapshot).
    pub async fn transaction<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut RegistryTxn<'_>) -> T,
    {
        let mut guard = self.inner.lock().await;
        let mut txn = RegistryTxn {
            members: &mut guard.members,
        };
        f(&mut txn)
    }

    /// A transactional snapshot of every member, in the registry's own iteration order
    /// (insertion order) — used as the placement tie-break per §4.6.
    pub async fn snapshot(&self) -> Vec<Member> {
        self.transaction(|txn| txn.iter().cloned().collect()).await
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Member> {
        self.transaction(|txn| txn.get_by_name(name).cloned())
            .await
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::member::model::Member;
    use std::collections::{BTreeMap, HashSet};

    fn sample_member(name: &str, addr: &str) -> Member {
        Member {
            id: Uuid::new_v4(),
            name: name.to_string(),
            address: addr.to_string(),
            state: MemberState::Created,
            roles: HashSet::new(),
            groups: ["default".to_string()].into(),
            failure_domain: None,
            architecture: 1,
            config: BTreeMap::new(),
            description: String::new(),
            last_seen_unix_ms: 0,
        }
    }

    #[tokio::test]
    async fn rejects_duplicate_name_and_address() {
        let registry = MemberRegistry::new(sample_member("local", "10.0.0.1:8443"));
        let err = registry
            .transaction(|txn| txn.insert(sample_member("local", "10.0.0.2:8443")))
            .await;
        assert!(err.is_err());

        let err = registry
            .transaction(|txn| txn.insert(sample_member("n2", "10.0.0.1:8443")))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn rejects_reserved_name() {
        let registry = MemberRegistry::new(sample_member("local", "10.0.0.1:8443"));
        let err = registry
            .transaction(|txn| txn.insert(sample_member("none", "10.0.0.2:8443")))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn same_state_transition_fails() {
        let registry = MemberRegistry::new(sample_member("local", "10.0.0.1:8443"));
        let err = registry
            .transaction(|txn| txn.transition_state("local", MemberState::Created))
            .await;
        assert!(err.is_err());
    }
}
