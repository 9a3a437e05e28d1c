// src/core/member/model.rs

//! Data model for a cluster member: the `Member` record, its lifecycle state
//! machine, role partitioning, and configuration-key validation.

use crate::core::ClusterError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// The reserved sentinel name. Never a valid candidate or member name.
pub const RESERVED_NONE_NAME: &str = "none";

/// The lifecycle state of a member, per the state machine in the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Pending,
    Created,
    Evacuated,
}

/// Whether a role is system-assigned (`Automatic`) or user-assignable (`Manual`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleClass {
    Automatic,
    Manual,
}

/// The full catalog of known roles, partitioned into automatic and manual. This is a
/// closed set: `validate_roles` rejects anything not listed here.
pub fn known_roles() -> &'static [(&'static str, RoleClass)] {
    &[
        ("database", RoleClass::Automatic),
        ("database-leader", RoleClass::Automatic),
        ("database-standby", RoleClass::Automatic),
        ("event-hub", RoleClass::Manual),
        ("ovn-chassis", RoleClass::Manual),
        ("custom", RoleClass::Manual),
    ]
}

pub fn role_class(role: &str) -> Option<RoleClass> {
    known_roles()
        .iter()
        .find(|(name, _)| *name == role)
        .map(|(_, class)| *class)
}

/// Validates a requested role set against the member's current roles.
///
/// Rules (§4.3): (a) automatic roles present in `current` may be preserved but may not
/// be added if absent; (b) all roles must be known; (c) duplicates are rejected.
/// Automatic roles are preserved implicitly if `requested` omits them.
///
/// `requested` is a slice, not a set: the duplicate check is the caller's contract, and
/// a `HashSet<String>` would have already silently collapsed the very duplicates this
/// function exists to reject.
pub fn validate_roles(
    current: &HashSet<String>,
    requested: &[String],
) -> Result<HashSet<String>, ClusterError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(requested.len());
    for role in requested {
        if !seen.insert(role.as_str()) {
            return Err(ClusterError::Validation(format!("duplicate role '{role}'")));
        }
    }

    for role in requested {
        let class = role_class(role)
            .ok_or_else(|| ClusterError::Validation(format!("unknown role '{role}'")))?;
        if class == RoleClass::Automatic && !current.contains(role) {
            return Err(ClusterError::Validation(format!(
                "cannot add automatic role '{role}': it is not already held"
            )));
        }
    }

    // Automatic roles held currently but omitted from the request are preserved.
    let mut effective: HashSet<String> = requested.iter().cloned().collect();
    for role in current {
        if role_class(role) == Some(RoleClass::Automatic) {
            effective.insert(role.clone());
        }
    }
    Ok(effective)
}

/// A known, validated member configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerInstanceMode {
    All,
    Group,
    Manual,
}

impl Default for SchedulerInstanceMode {
    fn default() -> Self {
        Self::All
    }
}

impl SchedulerInstanceMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "group" => Some(Self::Group),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Validates a member's `config` map: only `scheduler.instance` and keys prefixed with
/// `user.` are recognized; everything else is rejected.
pub fn validate_config(config: &BTreeMap<String, String>) -> Result<(), ClusterError> {
    for key in config.keys() {
        if key == "scheduler.instance" {
            let value = &config[key];
            if SchedulerInstanceMode::parse(value).is_none() {
                return Err(ClusterError::Validation(format!(
                    "invalid value '{value}' for scheduler.instance"
                )));
            }
        } else if !key.starts_with("user.") {
            return Err(ClusterError::Validation(format!(
                "unrecognized config key '{key}'"
            )));
        }
    }
    Ok(())
}

pub fn scheduler_instance_mode(config: &BTreeMap<String, String>) -> SchedulerInstanceMode {
    config
        .get("scheduler.instance")
        .and_then(|v| SchedulerInstanceMode::parse(v))
        .unwrap_or_default()
}

/// A cluster member: one node of the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub state: MemberState,
    pub roles: HashSet<String>,
    pub groups: HashSet<String>,
    pub failure_domain: Option<String>,
    pub architecture: u32,
    pub config: BTreeMap<String, String>,
    pub description: String,
    /// Wall-clock instant (as a monotonic heartbeat counter) of the last heartbeat seen
    /// for this member via the Replication Layer. Used by the offline-threshold check.
    pub last_seen_unix_ms: i64,
}

impl Member {
    /// The writable view over which the ETag is computed: everything a `PUT`/`PATCH`
    /// can change.
    pub fn writable_view(&self) -> WritableView<'_> {
        WritableView {
            config: &self.config,
            description: &self.description,
            roles: &self.roles,
            failure_domain: &self.failure_domain,
            groups: &self.groups,
        }
    }

    pub fn etag(&self) -> String {
        let view = self.writable_view();
        let canonical = serde_json::to_vec(&view).expect("writable view is always serializable");
        let digest = Sha256::digest(&canonical);
        hex::encode(digest)
    }
}

#[derive(Serialize)]
pub struct WritableView<'a> {
    pub config: &'a BTreeMap<String, String>,
    pub description: &'a str,
    pub roles: &'a HashSet<String>,
    pub failure_domain: &'a Option<String>,
    pub groups: &'a HashSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_automatic_role_not_in_request() {
        let current: HashSet<String> = ["database".into(), "custom".into()].into();
        let requested = vec!["custom".to_string()];
        let effective = validate_roles(&current, &requested).unwrap();
        assert!(effective.contains("database"));
        assert!(effective.contains("custom"));
    }

    #[test]
    fn rejects_adding_automatic_role_not_previously_held() {
        let current: HashSet<String> = ["custom".into()].into();
        let requested = vec!["database".to_string(), "custom".to_string()];
        assert!(validate_roles(&current, &requested).is_err());
    }

    #[test]
    fn rejects_unknown_role() {
        let current = HashSet::new();
        let requested = vec!["not-a-role".to_string()];
        assert!(validate_roles(&current, &requested).is_err());
    }

    #[test]
    fn rejects_duplicate_role_in_request() {
        let current = HashSet::new();
        let requested = vec!["custom".to_string(), "custom".to_string()];
        let err = validate_roles(&current, &requested).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn accepts_user_prefixed_config_keys() {
        let mut cfg = BTreeMap::new();
        cfg.insert("user.anything".to_string(), "value".to_string());
        assert!(validate_config(&cfg).is_ok());
    }

    #[test]
    fn rejects_unknown_config_keys() {
        let mut cfg = BTreeMap::new();
        cfg.insert("bogus.key".to_string(), "value".to_string());
        assert!(validate_config(&cfg).is_err());
    }
}
