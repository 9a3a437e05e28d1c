// src/core/operations/mod.rs

//! The Operation Registry: the external collaborator that tracks named, cancellable,
//! long-running tasks (join tokens, evacuate/restore runs, deletes) and their metadata.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::ClusterError;

/// The class of work an operation represents, per §3/§4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Token,
    Evacuate,
    Restore,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// A named long-running task, with an opaque JSON metadata blob whose shape is owned by
/// whichever coordinator created it (e.g. `JoinToken`'s fields, for `token`-class
/// operations).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub class: OperationClass,
    pub status: OperationStatus,
    pub subject: String,
    pub metadata: serde_json::Value,
}

/// The external interface onto operation bookkeeping. A production implementation
/// persists these rows the same way the Member Registry persists members; the
/// in-memory implementation below is for tests.
#[async_trait]
pub trait OperationRegistry: Send + Sync {
    async fn create(
        &self,
        class: OperationClass,
        subject: &str,
        metadata: serde_json::Value,
    ) -> Result<Operation, ClusterError>;

    async fn get(&self, id: Uuid) -> Result<Operation, ClusterError>;

    async fn list(
        &self,
        class: Option<OperationClass>,
        subject: Option<&str>,
    ) -> Result<Vec<Operation>, ClusterError>;

    async fn set_status(&self, id: Uuid, status: OperationStatus) -> Result<(), ClusterError>;

    async fn update_metadata(
        &self,
        id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<(), ClusterError>;

    /// Requests cancellation of a still-running operation. Returns a precondition error
    /// if the operation has already settled.
    async fn cancel(&self, id: Uuid) -> Result<(), ClusterError>;

    /// The cooperative cancellation token a coordinator should poll while doing the
    /// operation's work.
    fn cancellation_token(&self, id: Uuid) -> Option<CancellationToken>;
}

struct Entry {
    operation: Operation,
    cancellation: CancellationToken,
}

/// A `DashMap`-backed reference implementation, grounded in the same concurrent-map
/// shape the Member Registry exposes for reads (see `core::member::registry`), but
/// without the transactional wrapper — operation bookkeeping has no cross-row
/// invariants to protect.
pub struct InMemoryOperationRegistry {
    entries: DashMap<Uuid, Entry>,
}

impl InMemoryOperationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }
}

impl Default for InMemoryOperationRegistry {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl OperationRegistry for InMemoryOperationRegistry {
    async fn create(
        &self,
        class: OperationClass,
        subject: &str,
        metadata: serde_json::Value,
    ) -> Result<Operation, ClusterError> {
        let operation = Operation {
            id: Uuid::new_v4(),
            class,
            status: OperationStatus::Running,
            subject: subject.to_string(),
            metadata,
        };
        self.entries.insert(
            operation.id,
            Entry {
                operation: operation.clone(),
                cancellation: CancellationToken::new(),
            },
        );
        Ok(operation)
    }

    async fn get(&self, id: Uuid) -> Result<Operation, ClusterError> {
        self.entries
            .get(&id)
            .map(|e| e.operation.clone())
            .ok_or_else(|| ClusterError::NotFound(format!("operation '{id}' not found")))
    }

    async fn list(
        &self,
        class: Option<OperationClass>,
        subject: Option<&str>,
    ) -> Result<Vec<Operation>, ClusterError> {
        Ok(self
            .entries
            .iter()
            .map(|e| e.operation.clone())
            .filter(|op| class.is_none_or(|c| c == op.class))
            .filter(|op| subject.is_none_or(|s| s == op.subject))
            .collect())
    }

    async fn set_status(&self, id: Uuid, status: OperationStatus) -> Result<(), ClusterError> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| ClusterError::NotFound(format!("operation '{id}' not found")))?;
        entry.operation.status = status;
        Ok(())
    }

    async fn update_metadata(
        &self,
        id: Uuid,
        metadata: serde_json::Value,
    ) -> Result<(), ClusterError> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| ClusterError::NotFound(format!("operation '{id}' not found")))?;
        entry.operation.metadata = metadata;
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<(), ClusterError> {
        let entry = self
            .entries
            .get(&id)
            .ok_or_else(|| ClusterError::NotFound(format!("operation '{id}' not found")))?;
        if entry.operation.status != OperationStatus::Running {
            return Err(ClusterError::Precondition(format!(
                "operation '{id}' has already settled"
            )));
        }
        entry.cancellation.cancel();
        drop(entry);
        self.set_status(id, OperationStatus::Cancelled).await
    }

    fn cancellation_token(&self, id: Uuid) -> Option<CancellationToken> {
        self.entries.get(&id).map(|e| e.cancellation.clone())
    }
}
