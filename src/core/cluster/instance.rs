// src/core/cluster/instance.rs

//! The instance runtime: deliberately out of scope per the system's purpose statement,
//! modeled here only as the typed external interface this core depends on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

use crate::core::ClusterError;

/// How an instance should be evacuated, chosen per-instance from the effective mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvacuateAction {
    /// Stop only; the instance does not move.
    StopOnly,
    /// Cold migration: stop, then start elsewhere.
    Migrate,
    /// Live migration: moves without stopping.
    LiveMigrate,
}

/// The evacuation mode requested by a caller, before being resolved per-instance into an
/// `EvacuateAction` (§4.5 step 3a).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EvacuateMode {
    #[default]
    Auto,
    Stop,
    Migrate,
    LiveMigrate,
    Heal,
}

impl EvacuateMode {
    /// Parses a mode string, treating an empty string as `Auto` (the HTTP API's
    /// `mode` field defaults to `""`, not `"auto"`).
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            return Some(Self::Auto);
        }
        Self::from_str(s).ok()
    }

    pub fn skips_post_hooks(self) -> bool {
        matches!(self, Self::Heal)
    }
}

/// The restore mode requested by a caller (§4.5 Restore procedure step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RestoreMode {
    #[default]
    Full,
    Skip,
}

impl RestoreMode {
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            return Some(Self::Full);
        }
        Self::from_str(s).ok()
    }
}

/// Read-only view of an instance the Placement Engine needs: architecture, project,
/// and the two possible co-location hints (§4.6).
#[derive(Debug, Clone)]
pub struct PlacementView {
    pub architecture: u32,
    pub project: String,
    pub cluster_group: Option<String>,
    pub placement_group: Option<String>,
}

/// The minimal instance record this core manipulates. `config` carries the two
/// volatile keys the spec calls out by name: `volatile.evacuate.origin` and
/// `volatile.last_state.power`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub project: String,
    pub node: String,
    pub running: bool,
    pub migratable: bool,
    pub architecture: u32,
    pub host_shutdown_timeout_secs: u64,
    pub stop_priority: i32,
    pub database_id: u64,
    pub config: BTreeMap<String, String>,
}

pub const VOLATILE_EVACUATE_ORIGIN: &str = "volatile.evacuate.origin";
pub const VOLATILE_LAST_STATE_POWER: &str = "volatile.last_state.power";

impl Instance {
    pub fn placement_view(&self) -> PlacementView {
        PlacementView {
            architecture: self.architecture,
            project: self.project.clone(),
            cluster_group: self.config.get("volatile.cluster.group").cloned(),
            placement_group: self.config.get("placement.group").cloned(),
        }
    }

    pub fn evacuate_origin(&self) -> Option<&str> {
        self.config.get(VOLATILE_EVACUATE_ORIGIN).map(String::as_str)
    }
}

/// The external interface onto the instance runtime. Out of scope per the purpose
/// statement; this core only ever calls through it.
#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    /// Instances whose `node` equals `member_name`, in a stable request order.
    async fn list_on_member(&self, member_name: &str) -> Result<Vec<Instance>, ClusterError>;

    /// Instances anywhere whose `volatile.evacuate.origin == member_name`.
    async fn list_with_origin(&self, member_name: &str) -> Result<Vec<Instance>, ClusterError>;

    /// Attempts graceful shutdown within `timeout_secs`; "already stopped" is not an
    /// error. Returns whether the instance actually needed stopping.
    async fn stop_graceful(
        &self,
        instance: &str,
        project: &str,
        timeout_secs: u64,
    ) -> Result<(), ClusterError>;

    async fn stop_force(&self, instance: &str, project: &str) -> Result<(), ClusterError>;

    async fn start(&self, instance: &str, project: &str) -> Result<(), ClusterError>;

    /// Migrates `instance` to `target`, optionally live, optionally starting it
    /// afterward (cold migrations that were running before get started).
    async fn migrate(
        &self,
        instance: &str,
        project: &str,
        target: &str,
        live: bool,
        start_after: bool,
    ) -> Result<(), ClusterError>;

    /// Persists a config key/value pair on the instance (used for the two volatile
    /// keys above).
    async fn set_config_key(
        &self,
        instance: &str,
        project: &str,
        key: &str,
        value: Option<String>,
    ) -> Result<(), ClusterError>;

    async fn reload(&self, instance: &str, project: &str) -> Result<(), ClusterError>;

    async fn stop_local_network_services(&self) -> Result<(), ClusterError>;

    async fn start_local_network_services(&self) -> Result<(), ClusterError>;
}

/// A process-local `InstanceRuntime` backing store. No real scheduler or hypervisor
/// sits behind it; it exists so the daemon has something to drive when no external
/// instance runtime is configured.
pub struct InMemoryInstanceRuntime {
    instances: tokio::sync::Mutex<std::collections::HashMap<(String, String), Instance>>,
}

impl Default for InMemoryInstanceRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryInstanceRuntime {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            instances: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub async fn insert(&self, instance: Instance) {
        let mut guard = self.instances.lock().await;
        guard.insert((instance.project.clone(), instance.name.clone()), instance);
    }
}

#[async_trait]
impl InstanceRuntime for InMemoryInstanceRuntime {
    async fn list_on_member(&self, member_name: &str) -> Result<Vec<Instance>, ClusterError> {
        let guard = self.instances.lock().await;
        Ok(guard
            .values()
            .filter(|i| i.node == member_name)
            .cloned()
            .collect())
    }

    async fn list_with_origin(&self, member_name: &str) -> Result<Vec<Instance>, ClusterError> {
        let guard = self.instances.lock().await;
        Ok(guard
            .values()
            .filter(|i| i.evacuate_origin() == Some(member_name))
            .cloned()
            .collect())
    }

    async fn stop_graceful(
        &self,
        instance: &str,
        project: &str,
        _timeout_secs: u64,
    ) -> Result<(), ClusterError> {
        let mut guard = self.instances.lock().await;
        if let Some(entry) = guard.get_mut(&(project.to_string(), instance.to_string())) {
            entry.running = false;
        }
        Ok(())
    }

    async fn stop_force(&self, instance: &str, project: &str) -> Result<(), ClusterError> {
        self.stop_graceful(instance, project, 0).await
    }

    async fn start(&self, instance: &str, project: &str) -> Result<(), ClusterError> {
        let mut guard = self.instances.lock().await;
        if let Some(entry) = guard.get_mut(&(project.to_string(), instance.to_string())) {
            entry.running = true;
        }
        Ok(())
    }

    async fn migrate(
        &self,
        instance: &str,
        project: &str,
        target: &str,
        _live: bool,
        start_after: bool,
    ) -> Result<(), ClusterError> {
        let mut guard = self.instances.lock().await;
        if let Some(mut entry) = guard.remove(&(project.to_string(), instance.to_string())) {
            entry.node = target.to_string();
            entry.running = start_after;
            guard.insert((project.to_string(), instance.to_string()), entry);
        }
        Ok(())
    }

    async fn set_config_key(
        &self,
        instance: &str,
        project: &str,
        key: &str,
        value: Option<String>,
    ) -> Result<(), ClusterError> {
        let mut guard = self.instances.lock().await;
        if let Some(entry) = guard.get_mut(&(project.to_string(), instance.to_string())) {
            match value {
                Some(v) => {
                    entry.config.insert(key.to_string(), v);
                }
                None => {
                    entry.config.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn reload(&self, _instance: &str, _project: &str) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn stop_local_network_services(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn start_local_network_services(&self) -> Result<(), ClusterError> {
        Ok(())
    }
}
