// src/server/api/members.rs

//! Handlers for `/cluster/members` and its item/state sub-resources (§6).

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::cluster::instance::{EvacuateMode, RestoreMode};
use crate::core::cluster::router::{route, RouteDecision};
use crate::core::events::{LifecycleEvent, LifecycleEventKind};
use crate::core::member::{validate_config, validate_roles, Member, MemberState};
use crate::core::operations::{Operation, OperationClass};
use crate::core::state::ClusterDaemonState;
use crate::core::ClusterError;

type AppState = State<Arc<ClusterDaemonState>>;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub recursion: u8,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ListResponse {
    Urls(Vec<String>),
    Full(Vec<MemberRecord>),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemberRecord {
    pub name: String,
    pub address: String,
    pub state: MemberState,
    pub roles: HashSet<String>,
    pub groups: HashSet<String>,
    pub failure_domain: Option<String>,
    pub architecture: u32,
    pub config: BTreeMap<String, String>,
    pub description: String,
}

impl From<Member> for MemberRecord {
    fn from(m: Member) -> Self {
        Self {
            name: m.name,
            address: m.address,
            state: m.state,
            roles: m.roles,
            groups: m.groups,
            failure_domain: m.failure_domain,
            architecture: m.architecture,
            config: m.config,
            description: m.description,
        }
    }
}

/// `GET /cluster/members` — list URLs (`recursion=0`) or full records (`recursion=1`).
pub async fn list_members(
    State(state): AppState,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ClusterError> {
    let members = state.registry.snapshot().await;
    if query.recursion == 0 {
        let urls = members
            .into_iter()
            .map(|m| format!("/cluster/members/{}", m.name))
            .collect();
        Ok(Json(ListResponse::Urls(urls)))
    } else {
        let records = members.into_iter().map(MemberRecord::from).collect();
        Ok(Json(ListResponse::Full(records)))
    }
}

#[derive(Debug, Deserialize)]
pub struct JoinTokenRequest {
    pub server_name: String,
}

/// `POST /cluster/members` — request a join token.
pub async fn request_join_token(
    State(state): AppState,
    Json(body): Json<JoinTokenRequest>,
) -> Result<Json<Operation>, ClusterError> {
    if !state.config.cluster.enabled {
        return Err(ClusterError::NotClustered);
    }
    let operation = state
        .join_token_broker
        .issue(&body.server_name, &state.registry, &state.identity)
        .await?;
    Ok(Json(operation))
}

/// `GET /cluster/members/{name}` — return the member record with an ETag.
pub async fn get_member(
    State(state): AppState,
    Path(name): Path<String>,
) -> Result<(HeaderMap, Json<MemberRecord>), ClusterError> {
    let member = state
        .registry
        .get_by_name(&name)
        .await
        .ok_or_else(|| ClusterError::NotFound(format!("member '{name}' not found")))?;
    let mut headers = HeaderMap::new();
    if let Ok(value) = axum::http::HeaderValue::from_str(&member.etag()) {
        headers.insert(axum::http::header::ETAG, value);
    }
    Ok((headers, Json(MemberRecord::from(member))))
}

#[derive(Debug, Deserialize)]
pub struct MemberUpdateRequest {
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
    /// Deliberately a `Vec`, not a `HashSet`: deduplicating at the wire boundary would
    /// let Serde silently swallow the duplicate-role violation `validate_roles` exists
    /// to reject.
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub failure_domain: Option<String>,
    #[serde(default)]
    pub groups: HashSet<String>,
}

/// `PUT`/`PATCH` `/cluster/members/{name}` — full/partial update (§4.3).
pub async fn update_member(
    State(state): AppState,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MemberUpdateRequest>,
) -> Result<Json<MemberRecord>, ClusterError> {
    let subject_address = state
        .registry
        .get_by_name(&name)
        .await
        .ok_or_else(|| ClusterError::NotFound(format!("member '{name}' not found")))?
        .address;
    let local_address = state
        .local_address()
        .await
        .ok_or_else(|| ClusterError::NotClustered)?;
    let decision = route(
        &local_address,
        state.leader_address().await.as_deref(),
        Some(&subject_address),
    )?;
    if !matches!(decision, RouteDecision::ServeLocally) {
        return Err(not_served_locally_error(decision));
    }

    let if_match = headers
        .get(axum::http::header::IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if body.groups.is_empty() {
        return Err(ClusterError::Validation("groups must be non-empty".into()));
    }
    validate_config(&body.config)?;

    let updated = state
        .registry
        .transaction(|txn| -> Result<Member, ClusterError> {
            let member = txn
                .get_by_name_mut(&name)
                .ok_or_else(|| ClusterError::NotFound(format!("member '{name}' not found")))?;

            if let Some(expected_etag) = &if_match {
                if &member.etag() != expected_etag {
                    return Err(ClusterError::Precondition(
                        "ETag does not match current member state".into(),
                    ));
                }
            }

            let effective_roles = validate_roles(&member.roles, &body.roles)?;
            member.config = body.config.clone();
            member.description = body.description.clone();
            member.roles = effective_roles;
            member.failure_domain = body.failure_domain.clone();
            member.groups = body.groups.clone();
            Ok(member.clone())
        })
        .await?;

    state.events.emit(LifecycleEvent {
        kind: LifecycleEventKind::MemberUpdated,
        location: updated.name.clone(),
        detail: serde_json::json!({}),
    });

    Ok(Json(MemberRecord::from(updated)))
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub new_name: String,
}

/// `POST /cluster/members/{name}` — rename.
pub async fn rename_member(
    State(state): AppState,
    Path(name): Path<String>,
    Json(body): Json<RenameRequest>,
) -> Result<Json<MemberRecord>, ClusterError> {
    let subject_address = state
        .registry
        .get_by_name(&name)
        .await
        .ok_or_else(|| ClusterError::NotFound(format!("member '{name}' not found")))?
        .address;
    let local_address = state
        .local_address()
        .await
        .ok_or_else(|| ClusterError::NotClustered)?;
    let decision = route(
        &local_address,
        state.leader_address().await.as_deref(),
        Some(&subject_address),
    )?;
    if !matches!(decision, RouteDecision::ServeLocally) {
        return Err(not_served_locally_error(decision));
    }

    let renamed = state
        .registry
        .transaction(|txn| -> Result<Member, ClusterError> {
            if txn.get_by_name(&body.new_name).is_some() {
                return Err(ClusterError::Conflict(format!(
                    "a member named '{}' already exists",
                    body.new_name
                )));
            }
            let member = txn
                .get_by_name_mut(&name)
                .ok_or_else(|| ClusterError::NotFound(format!("member '{name}' not found")))?;
            member.name = body.new_name.clone();
            Ok(member.clone())
        })
        .await?;

    state.events.emit(LifecycleEvent {
        kind: LifecycleEventKind::MemberRenamed,
        location: renamed.name.clone(),
        detail: serde_json::json!({"previous_name": name}),
    });

    Ok(Json(MemberRecord::from(renamed)))
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

/// `DELETE /cluster/members/{name}` — remove (§4.4).
pub async fn delete_member(
    State(state): AppState,
    Path(name): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<(), ClusterError> {
    let is_local_subject = name == state.local_member_name;
    let _self_removal_guard = if is_local_subject {
        Some(state.self_removal_locks.acquire(&name).await)
    } else {
        None
    };

    let local_address = state
        .local_address()
        .await
        .ok_or_else(|| ClusterError::NotClustered)?;
    let decision = route(&local_address, state.leader_address().await.as_deref(), None)?;
    if !matches!(decision, RouteDecision::ServeLocally) {
        return Err(not_served_locally_error(decision));
    }

    state.member_delete.delete(&name, query.force).await
}

#[derive(Debug, Serialize)]
pub struct MemberStateSnapshot {
    pub name: String,
    pub state: MemberState,
}

/// `GET /cluster/members/{name}/state` — local state snapshot.
pub async fn get_member_state(
    State(state): AppState,
    Path(name): Path<String>,
) -> Result<Json<MemberStateSnapshot>, ClusterError> {
    let member = state
        .registry
        .get_by_name(&name)
        .await
        .ok_or_else(|| ClusterError::NotFound(format!("member '{name}' not found")))?;
    Ok(Json(MemberStateSnapshot {
        name: member.name,
        state: member.state,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    Evacuate,
    Restore,
}

#[derive(Debug, Deserialize)]
pub struct StateActionRequest {
    pub action: StateAction,
    #[serde(default)]
    pub mode: String,
}

/// `POST /cluster/members/{name}/state` — evacuate or restore (§4.5).
pub async fn post_member_state(
    State(state): AppState,
    Path(name): Path<String>,
    Json(body): Json<StateActionRequest>,
) -> Result<Json<Operation>, ClusterError> {
    match body.action {
        StateAction::Evacuate => {
            let mode = EvacuateMode::parse(&body.mode)
                .ok_or_else(|| ClusterError::Validation(format!("invalid evacuate mode '{}'", body.mode)))?;
            let operation = state
                .operations
                .create(OperationClass::Evacuate, &name, serde_json::json!({}))
                .await?;
            let coordinator = state.evacuation.clone();
            let name_owned = name.clone();
            let op_for_task = operation.clone();
            let operations = state.operations.clone();
            tokio::spawn(async move {
                let result = coordinator.evacuate(&name_owned, mode, &op_for_task).await;
                crate::core::errors::log_and_drop(
                    "evacuation failed",
                    settle_operation(operations.as_ref(), op_for_task.id, result).await,
                );
            });
            Ok(Json(operation))
        }
        StateAction::Restore => {
            let mode = RestoreMode::parse(&body.mode)
                .ok_or_else(|| ClusterError::Validation(format!("invalid restore mode '{}'", body.mode)))?;
            let operation = state
                .operations
                .create(OperationClass::Restore, &name, serde_json::json!({}))
                .await?;
            let coordinator = state.evacuation.clone();
            let name_owned = name.clone();
            let op_for_task = operation.clone();
            let operations = state.operations.clone();
            tokio::spawn(async move {
                let result = coordinator.restore(&name_owned, mode, &op_for_task).await;
                crate::core::errors::log_and_drop(
                    "restore failed",
                    settle_operation(operations.as_ref(), op_for_task.id, result).await,
                );
            });
            Ok(Json(operation))
        }
    }
}

async fn settle_operation(
    operations: &dyn crate::core::operations::OperationRegistry,
    id: uuid::Uuid,
    result: Result<(), ClusterError>,
) -> Result<(), ClusterError> {
    use crate::core::operations::OperationStatus;
    let status = if result.is_ok() {
        OperationStatus::Succeeded
    } else {
        OperationStatus::Failed
    };
    operations.set_status(id, status).await?;
    result
}

fn not_served_locally_error(decision: RouteDecision) -> ClusterError {
    match decision {
        RouteDecision::ServeLocally => unreachable!("caller already checked ServeLocally"),
        RouteDecision::ForwardToLeader { address } => ClusterError::NotLeader { leader_addr: address },
        RouteDecision::ForwardToNamed { address } => ClusterError::NotLeader { leader_addr: address },
    }
}
