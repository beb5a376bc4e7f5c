//! Idempotency keys and lookup outcomes.
//!
//! `key = SHA-256(operation_name ‖ 0x1f ‖ SHA-256(canonical_json(payload)))`,
//! hex encoded. The operation name doubles as the key's scope.

use chrono::{DateTime, Utc};
use memoria_shared::{ReceiptId, UnitOfWorkId};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::canonical::{canonical_digest, sha256};
use crate::error::Result;

const SCOPE_SEPARATOR: u8 = 0x1f;
const DEFAULT_SCOPE: &str = "default";

/// Deterministic identifier of an operation + payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    key: String,
    scope: String,
}

impl IdempotencyKey {
    /// Derive a key from an operation name and its payload.
    pub fn derive<T: Serialize + ?Sized>(operation: &str, payload: &T) -> Result<Self> {
        let payload_digest = canonical_digest(payload)?;

        let mut material = Vec::with_capacity(operation.len() + 1 + payload_digest.len());
        material.extend_from_slice(operation.as_bytes());
        material.push(SCOPE_SEPARATOR);
        material.extend_from_slice(&payload_digest);

        Ok(Self {
            key: hex::encode(sha256(&material)),
            scope: operation.to_string(),
        })
    }

    /// Use a caller-supplied key verbatim (e.g. a request header).
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            scope: DEFAULT_SCOPE.to_string(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Result recorded by the commit that first executed a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub key: String,
    pub scope: String,
    pub result: serde_json::Value,
    pub unit_of_work_id: Option<UnitOfWorkId>,
    pub receipt_id: Option<ReceiptId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of looking up a key.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyLookup {
    /// A previous commit recorded this result.
    Cached(CachedResult),
    /// Another unit of work has reserved the key and has not finished.
    InFlight {
        owner: UnitOfWorkId,
        reserved_at: DateTime<Utc>,
    },
    /// Never seen, or expired.
    Absent,
}

impl IdempotencyLookup {
    pub fn is_absent(&self) -> bool {
        matches!(self, IdempotencyLookup::Absent)
    }
}

/// Counts of idempotency records by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyStats {
    pub completed: u64,
    pub in_flight: u64,
}
