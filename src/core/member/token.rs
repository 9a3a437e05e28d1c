// src/core/member/token.rs

//! The join-token payload carried inside a `token`-class Operation's metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A one-shot, time-bounded credential a new member presents to enroll.
///
/// This is stored as the metadata of a long-running `token`-class Operation (see
/// `core::operations`), never as a standalone durable record — the Operation Registry
/// is its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinToken {
    pub server_name: String,
    pub secret: String,
    pub cluster_certificate_fingerprint: String,
    pub endpoint_addresses: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl JoinToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The cluster's TLS identity, as read by the Join-Token Broker when stamping a new
/// token's `cluster_certificate_fingerprint`. Certificate issuance itself is out of
/// scope for this core.
#[derive(Debug, Clone)]
pub struct ClusterIdentity {
    pub certificate_der: Vec<u8>,
}

impl ClusterIdentity {
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(&self.certificate_der))
    }
}
