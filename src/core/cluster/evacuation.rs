// src/core/cluster/evacuation.rs

//! The Evacuation Coordinator (§4.5): a per-member, single-flight state machine that
//! drains or restores every workload on a member.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

use crate::core::cluster::instance::{
    EvacuateAction, EvacuateMode, Instance, InstanceRuntime, RestoreMode, VOLATILE_EVACUATE_ORIGIN,
    VOLATILE_LAST_STATE_POWER,
};
use crate::core::cluster::placement::{
    online_member_names, place_instance, LoadView, PlacementGroupCache, PlacementGroupResolver,
};
use crate::core::cluster::reverter::Reverter;
use crate::core::events::{LifecycleEvent, LifecycleEventEmitter, LifecycleEventKind};
use crate::core::member::{Member, MemberRegistry, MemberState};
use crate::core::metrics::{EVACUATION_DURATION_SECONDS, EVACUATION_OPERATIONS_TOTAL};
use crate::core::operations::{Operation, OperationClass, OperationRegistry};
use crate::core::ClusterError;

/// The two mutually-exclusive operation kinds guarded per member (§4.5 first
/// paragraph): evacuating rejects when a restore is in flight, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlightKind {
    Evacuate,
    Restore,
}

/// Tracks which member currently has an in-flight evacuate/restore, enforcing mutual
/// exclusion (§8 invariant: evacuate/restore pairs on the same member are totally
/// ordered).
#[derive(Default)]
pub struct EvacuationLocks {
    in_flight: DashMap<String, InFlightKind>,
}

struct InFlightGuard<'a> {
    locks: &'a EvacuationLocks,
    member_name: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.locks.in_flight.remove(&self.member_name);
    }
}

impl EvacuationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, member_name: &str, kind: InFlightKind) -> Result<InFlightGuard<'_>, ClusterError> {
        match self.in_flight.entry(member_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                let verb = match kind {
                    InFlightKind::Evacuate => "evacuate",
                    InFlightKind::Restore => "restore",
                };
                let other = match entry.get() {
                    InFlightKind::Evacuate => "an evacuate",
                    InFlightKind::Restore => "a restore",
                };
                Err(ClusterError::Validation(format!(
                    "Cannot {verb} member '{member_name}' while {other} operation is in progress"
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(kind);
                Ok(InFlightGuard {
                    locks: self,
                    member_name: member_name.to_string(),
                })
            }
        }
    }
}

pub struct EvacuationCoordinator {
    registry: Arc<MemberRegistry>,
    runtime: Arc<dyn InstanceRuntime>,
    operations: Arc<dyn OperationRegistry>,
    locks: Arc<EvacuationLocks>,
    placement_resolver: Arc<dyn PlacementGroupResolver>,
    load: Arc<dyn LoadView + Send + Sync>,
    /// Members with no heartbeat inside this window are not placement candidates (§4.6
    /// step 1).
    offline_threshold: Duration,
    events: Arc<dyn LifecycleEventEmitter>,
}

impl EvacuationCoordinator {
    pub fn new(
        registry: Arc<MemberRegistry>,
        runtime: Arc<dyn InstanceRuntime>,
        operations: Arc<dyn OperationRegistry>,
        locks: Arc<EvacuationLocks>,
        placement_resolver: Arc<dyn PlacementGroupResolver>,
        load: Arc<dyn LoadView + Send + Sync>,
        offline_threshold: Duration,
        events: Arc<dyn LifecycleEventEmitter>,
    ) -> Self {
        Self {
            registry,
            runtime,
            operations,
            locks,
            placement_resolver,
            load,
            offline_threshold,
            events,
        }
    }

    fn resolve_action(&self, instance: &Instance, mode: EvacuateMode) -> EvacuateAction {
        match mode {
            EvacuateMode::Stop => EvacuateAction::StopOnly,
            EvacuateMode::Migrate => EvacuateAction::Migrate,
            EvacuateMode::LiveMigrate => EvacuateAction::LiveMigrate,
            EvacuateMode::Auto | EvacuateMode::Heal => {
                if !instance.migratable {
                    EvacuateAction::StopOnly
                } else {
                    EvacuateAction::Migrate
                }
            }
        }
    }

    /// Runs the full evacuation procedure on `member_name` (§4.5). `operation` receives
    /// progress updates through its metadata.
    pub async fn evacuate(
        &self,
        member_name: &str,
        mode: EvacuateMode,
        operation: &Operation,
    ) -> Result<(), ClusterError> {
        let started_at = tokio::time::Instant::now();
        let _guard = self.locks.acquire(member_name, InFlightKind::Evacuate)?;
        let mut reverter = Reverter::new();

        let previous_state = self
            .registry
            .transaction(|txn| txn.transition_state(member_name, MemberState::Evacuated))
            .await?;
        EVACUATION_DURATION_SECONDS.observe(started_at.elapsed().as_secs_f64());

        {
            let registry = self.registry.clone();
            let member_name = member_name.to_string();
            reverter.arm(move || async move {
                log_and_drop_transition(&registry, &member_name, previous_state).await;
            });
        }

        let result = self.evacuate_inner(member_name, mode, operation).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                reverter.revert().await;
            }
        } else {
            reverter.disarm();
        }
        EVACUATION_OPERATIONS_TOTAL
            .with_label_values(&["evacuate", if result.is_ok() { "success" } else { "failure" }])
            .inc();
        result
    }

    async fn evacuate_inner(
        &self,
        member_name: &str,
        mode: EvacuateMode,
        operation: &Operation,
    ) -> Result<(), ClusterError> {
        let instances = self.runtime.list_on_member(member_name).await?;
        let cancellation = self.operations.cancellation_token(operation.id);

        for instance in &instances {
            if cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
                return Err(ClusterError::Conflict(
                    "evacuation cancelled by caller".into(),
                ));
            }
            self.evacuate_one(member_name, instance, mode).await?;
            self.report_progress(operation, &format!("evacuated instance '{}'", instance.name))
                .await;
        }

        if mode != EvacuateMode::Heal {
            self.runtime.stop_local_network_services().await?;
            self.events.emit(LifecycleEvent {
                kind: LifecycleEventKind::MemberEvacuated,
                location: member_name.to_string(),
                detail: serde_json::json!({"mode": mode.to_string()}),
            });
        }

        Ok(())
    }

    async fn evacuate_one(
        &self,
        member_name: &str,
        instance: &Instance,
        mode: EvacuateMode,
    ) -> Result<(), ClusterError> {
        let action = self.resolve_action(instance, mode);
        let was_running = instance.running;

        if instance.running && action != EvacuateAction::LiveMigrate {
            let stop_result = self
                .runtime
                .stop_graceful(
                    &instance.name,
                    &instance.project,
                    if instance.host_shutdown_timeout_secs == 0 {
                        30
                    } else {
                        instance.host_shutdown_timeout_secs
                    },
                )
                .await;
            if stop_result.is_err() {
                self.runtime
                    .stop_force(&instance.name, &instance.project)
                    .await?;
            }
            self.runtime
                .set_config_key(
                    &instance.name,
                    &instance.project,
                    VOLATILE_LAST_STATE_POWER,
                    Some("RUNNING".to_string()),
                )
                .await?;
        }

        if action == EvacuateAction::StopOnly {
            return Ok(());
        }

        let view = instance.placement_view();
        let members = self.registry.snapshot().await;
        let floor_unix_ms = Utc::now().timestamp_millis() - self.offline_threshold.as_millis() as i64;
        let mut online = online_member_names(&members, floor_unix_ms);
        // A member cannot migrate its own instances to itself.
        online.remove(member_name);
        let cache = PlacementGroupCache::new();

        let target = match place_instance(
            &members,
            &online,
            None,
            &view,
            &cache,
            self.placement_resolver.as_ref(),
            self.load.as_ref(),
        )
        .await
        {
            Ok(target) => target,
            Err(_) => {
                tracing::warn!(
                    instance = %instance.name,
                    member = %member_name,
                    "no eligible placement target; skipping instance, evacuation proceeds"
                );
                return Ok(());
            }
        };

        if instance.evacuate_origin().is_none() {
            self.runtime
                .set_config_key(
                    &instance.name,
                    &instance.project,
                    VOLATILE_EVACUATE_ORIGIN,
                    Some(member_name.to_string()),
                )
                .await?;
        }

        let live = action == EvacuateAction::LiveMigrate;
        let start_after = was_running;
        self.runtime
            .migrate(&instance.name, &instance.project, &target, live, start_after)
            .await?;

        Ok(())
    }

    /// Runs the full restore procedure on `member_name` (§4.5 Restore procedure).
    pub async fn restore(
        &self,
        member_name: &str,
        mode: RestoreMode,
        operation: &Operation,
    ) -> Result<(), ClusterError> {
        let _guard = self.locks.acquire(member_name, InFlightKind::Restore)?;

        if mode == RestoreMode::Skip {
            self.registry
                .transaction(|txn| txn.transition_state(member_name, MemberState::Created))
                .await?;
            self.events.emit(LifecycleEvent {
                kind: LifecycleEventKind::MemberRestored,
                location: member_name.to_string(),
                detail: serde_json::json!({"mode": "skip"}),
            });
            EVACUATION_OPERATIONS_TOTAL
                .with_label_values(&["restore", "success"])
                .inc();
            return Ok(());
        }

        let mut reverter = Reverter::new();
        let previous_state = self
            .registry
            .transaction(|txn| txn.transition_state(member_name, MemberState::Created))
            .await?;
        {
            let registry = self.registry.clone();
            let member_name_owned = member_name.to_string();
            reverter.arm(move || async move {
                log_and_drop_transition(&registry, &member_name_owned, previous_state).await;
            });
        }

        let result = self.restore_inner(member_name, operation).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                reverter.revert().await;
            }
        } else {
            reverter.disarm();
        }
        EVACUATION_OPERATIONS_TOTAL
            .with_label_values(&["restore", if result.is_ok() { "success" } else { "failure" }])
            .inc();
        result
    }

    async fn restore_inner(&self, member_name: &str, operation: &Operation) -> Result<(), ClusterError> {
        let local_instances = self.runtime.list_on_member(member_name).await?;
        let remote_instances = self.runtime.list_with_origin(member_name).await?;
        let cancellation = self.operations.cancellation_token(operation.id);

        self.runtime.start_local_network_services().await?;

        for instance in &local_instances {
            if cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
                return Err(ClusterError::Conflict("restore cancelled by caller".into()));
            }
            if instance.config.get(VOLATILE_LAST_STATE_POWER).map(String::as_str) == Some("RUNNING")
                && !instance.running
            {
                self.runtime.start(&instance.name, &instance.project).await?;
            }
        }

        for instance in &remote_instances {
            if cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
                return Err(ClusterError::Conflict("restore cancelled by caller".into()));
            }
            let can_live_migrate = instance.migratable;
            if instance.running && !can_live_migrate {
                let stop_result = self
                    .runtime
                    .stop_graceful(
                        &instance.name,
                        &instance.project,
                        if instance.host_shutdown_timeout_secs == 0 {
                            30
                        } else {
                            instance.host_shutdown_timeout_secs
                        },
                    )
                    .await;
                if stop_result.is_err() {
                    self.runtime
                        .stop_force(&instance.name, &instance.project)
                        .await?;
                }
            }

            let live = instance.running && can_live_migrate;
            self.runtime
                .migrate(&instance.name, &instance.project, member_name, live, false)
                .await?;
            self.runtime.reload(&instance.name, &instance.project).await?;
            self.runtime
                .set_config_key(&instance.name, &instance.project, VOLATILE_EVACUATE_ORIGIN, None)
                .await?;

            if instance.running && !live {
                self.runtime.start(&instance.name, &instance.project).await?;
            }

            self.report_progress(
                operation,
                &format!("restored instance '{}' to '{member_name}'", instance.name),
            )
            .await;
        }

        self.events.emit(LifecycleEvent {
            kind: LifecycleEventKind::MemberRestored,
            location: member_name.to_string(),
            detail: serde_json::json!({}),
        });

        Ok(())
    }

    async fn report_progress(&self, operation: &Operation, message: &str) {
        let mut metadata = operation.metadata.clone();
        if let serde_json::Value::Object(ref mut map) = metadata {
            let progress = map
                .entry("progress")
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            if let serde_json::Value::Array(ref mut entries) = progress {
                entries.push(serde_json::Value::String(message.to_string()));
            }
        }
        let _ = self.operations.update_metadata(operation.id, metadata).await;
    }
}

async fn log_and_drop_transition(registry: &MemberRegistry, member_name: &str, revert_to: MemberState) {
    let result = registry
        .transaction(|txn| txn.transition_state(member_name, revert_to))
        .await
        .map(|_| ());
    crate::core::errors::log_and_drop("failed to revert member state transition", result);
}

/// Trivial load view over a static instance list, used by coordinators that already
/// hold the registry's own snapshot and don't need a live count source.
pub struct SnapshotLoadView {
    counts: std::collections::HashMap<String, usize>,
}

impl SnapshotLoadView {
    pub fn from_members(members: &[Member], instances: &[Instance]) -> Self {
        let mut counts: std::collections::HashMap<String, usize> =
            members.iter().map(|m| (m.name.clone(), 0)).collect();
        for instance in instances {
            *counts.entry(instance.node.clone()).or_insert(0) += 1;
        }
        Self { counts }
    }
}

impl LoadView for SnapshotLoadView {
    fn instance_count(&self, member_name: &str) -> usize {
        *self.counts.get(member_name).unwrap_or(&0)
    }
}
