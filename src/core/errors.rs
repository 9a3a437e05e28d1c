// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The coarse error kind, used to map a [`ClusterError`] onto an HTTP status
/// and to decide whether the reverter (see `core::cluster::reverter`) should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Precondition,
    NotFound,
    NotLeader,
    NotClustered,
    Conflict,
    Transient,
    Fatal,
}

/// The main error enum, representing all possible failures within the cluster core.
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("bad request: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("this node is not the leader; redirect to {leader_addr}")]
    NotLeader { leader_addr: String },

    #[error("this node is not clustered")]
    NotClustered,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::Validation(_) => ErrorKind::Validation,
            ClusterError::Precondition(_) => ErrorKind::Precondition,
            ClusterError::NotFound(_) => ErrorKind::NotFound,
            ClusterError::NotLeader { .. } => ErrorKind::NotLeader,
            ClusterError::NotClustered => ErrorKind::NotClustered,
            ClusterError::Conflict(_) => ErrorKind::Conflict,
            ClusterError::Transient(_) => ErrorKind::Transient,
            ClusterError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether this failure, raised mid-scope, should trigger the reverter.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal | ErrorKind::Conflict)
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::Internal(format!("IO error: {e}"))
    }
}

impl From<uuid::Error> for ClusterError {
    fn from(e: uuid::Error) -> Self {
        ClusterError::Internal(format!("invalid uuid: {e}"))
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Internal(format!("json error: {e}"))
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(e: reqwest::Error) -> Self {
        ClusterError::Transient(format!("peer RPC failed: {e}"))
    }
}

/// Wraps an error that is always safe to log and discard (background tasks never
/// propagate failures outward).
pub fn log_and_drop<T>(context: &str, result: Result<T, ClusterError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "{context}");
    }
}

/// A shareable, clonable handle to a [`ClusterError`] for use in places (e.g. operation
/// metadata) that need to store an error alongside other `Clone` data.
pub type SharedError = Arc<ClusterError>;
