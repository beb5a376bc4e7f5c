//! Storage error taxonomy
//!
//! Every fallible operation of the substrate returns a [`StorageError`].
//! Engine errors are classified on the way in: lock contention becomes a
//! retryable [`StorageError::TransactionConflict`], transport-level faults
//! mark the connection as broken so the pool retires it.

use memoria_shared::{EventId, ReceiptId, UnitOfWorkState};
use thiserror::Error;

use crate::migration::MigrationError;

/// SQLite primary result codes that signal lock contention.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Errors surfaced by the storage substrate.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No connection became available before the acquire timeout.
    #[error("Connection pool exhausted: capacity {capacity}, waited {waited_ms}ms")]
    PoolExhausted { capacity: u32, waited_ms: u64 },

    /// Write-write collision reported by the engine. Retry with the same idempotency key.
    #[error("Transaction conflict: {message}")]
    TransactionConflict { message: String },

    /// A duplicate of this idempotency key is still executing.
    #[error("Idempotency key {key} is already in flight")]
    IdempotencyInFlight { key: String },

    /// A previously applied migration no longer matches its recorded checksum.
    #[error("Migration {version} checksum mismatch: recorded {recorded}, computed {computed}")]
    MigrationChecksumMismatch {
        version: i64,
        recorded: String,
        computed: String,
    },

    /// Delivery of an outbox event failed. Contained within the worker.
    #[error("Outbox delivery failed for event {event_id}: {message}")]
    OutboxDeliveryFailure { event_id: EventId, message: String },

    /// Integrity alarm raised while verifying the receipt chain.
    #[error("Receipt chain broken at sequence {sequence}: {reason}")]
    ReceiptChainBroken {
        sequence: i64,
        receipt_id: Option<ReceiptId>,
        reason: String,
    },

    #[error("Deadline exceeded while {stage}")]
    DeadlineExceeded { stage: &'static str },

    #[error("Invalid unit of work transition from {from} to {to}")]
    InvalidState {
        from: UnitOfWorkState,
        to: UnitOfWorkState,
    },

    #[error("Unknown store: {0}")]
    UnknownStore(String),

    #[error("Store '{store}' failed: {message}")]
    Store { store: String, message: String },

    /// A per-event retry policy that would break non-decreasing backoff.
    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Migration error: {0}")]
    Migration(MigrationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The connection failed at the transport level and must not be reused.
    #[error("Connection broken: {0}")]
    ConnectionBroken(#[source] sqlx::Error),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StorageError {
    /// Whether the caller may retry the same operation (with the same idempotency key).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::TransactionConflict { .. }
                | StorageError::PoolExhausted { .. }
                | StorageError::IdempotencyInFlight { .. }
        )
    }

    /// Whether the connection that produced this error must be retired.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, StorageError::ConnectionBroken(_))
    }

    pub fn store(store: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::Store {
            store: store.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        if is_lock_contention(&err) {
            return StorageError::TransactionConflict {
                message: err.to_string(),
            };
        }
        if is_connection_fault(&err) {
            return StorageError::ConnectionBroken(err);
        }
        StorageError::Database(err)
    }
}

impl From<MigrationError> for StorageError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::ChecksumMismatch {
                version,
                recorded,
                computed,
            } => StorageError::MigrationChecksumMismatch {
                version,
                recorded,
                computed,
            },
            other => StorageError::Migration(other),
        }
    }
}

/// True when the engine reported `SQLITE_BUSY` or `SQLITE_LOCKED`, including
/// their extended codes (e.g. `SQLITE_BUSY_SNAPSHOT` = 517).
pub fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let by_code = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
                .unwrap_or(false);
            by_code || db.message().contains("database is locked")
        }
        _ => false,
    }
}

/// True for errors after which the connection cannot be trusted.
pub fn is_connection_fault(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::PoolClosed
    )
}

pub type Result<T> = std::result::Result<T, StorageError>;
