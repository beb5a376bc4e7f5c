//! Substrate schema
//!
//! The tables the unit of work, outbox, idempotency store and receipt
//! ledger write to. Applications append their own migrations after these
//! with [`MigrationSet::extend`]; numbering continues from
//! [`CORE_SCHEMA_VERSION`].
//!
//! Timestamps are stored as INTEGER milliseconds since the Unix epoch,
//! JSON documents as TEXT.

use memoria_storage_core::{Migration, MigrationError, MigrationSet};

/// Last version owned by the substrate.
pub const CORE_SCHEMA_VERSION: i64 = 4;

/// Bookkeeping tables of the migration runner itself. Created before the
/// advisory lock is taken, so they are not versioned.
pub(crate) const MIGRATION_BOOTSTRAP: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    checksum TEXT NOT NULL,
    description TEXT NOT NULL,
    applied_at INTEGER NOT NULL,
    rollback_script TEXT
);

CREATE TABLE IF NOT EXISTS schema_migration_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    owner TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

const OUTBOX_UP: &str = r#"
CREATE TABLE outbox_events (
    id TEXT PRIMARY KEY,
    unit_of_work_id TEXT,
    aggregate_id TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    event_metadata TEXT,
    sequence_number INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    delivery_attempts INTEGER NOT NULL DEFAULT 0,
    delivery_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (delivery_status IN ('pending', 'processing', 'delivered', 'failed', 'dlq')),
    first_attempt_at INTEGER,
    last_attempt_at INTEGER,
    next_retry_at INTEGER NOT NULL,
    delivered_at INTEGER,
    target_topic TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    max_attempts INTEGER NOT NULL,
    base_delay_ms INTEGER NOT NULL,
    max_delay_ms INTEGER NOT NULL,
    backoff_multiplier REAL NOT NULL,
    last_error TEXT,
    lease_owner TEXT,
    lease_expires_at INTEGER,
    UNIQUE (aggregate_id, sequence_number)
);

CREATE INDEX idx_outbox_events_open
    ON outbox_events (aggregate_id, sequence_number, created_at)
    WHERE delivery_status IN ('pending', 'processing', 'failed');

CREATE INDEX idx_outbox_events_delivered
    ON outbox_events (delivered_at)
    WHERE delivery_status = 'delivered';
"#;

const OUTBOX_DOWN: &str = r#"
DROP INDEX IF EXISTS idx_outbox_events_delivered;
DROP INDEX IF EXISTS idx_outbox_events_open;
DROP TABLE IF EXISTS outbox_events;
"#;

const DLQ_UP: &str = r#"
CREATE TABLE outbox_dlq (
    id TEXT PRIMARY KEY,
    original_event_id TEXT NOT NULL UNIQUE,
    aggregate_id TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    event_metadata TEXT,
    target_topic TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    reason TEXT NOT NULL,
    error_message TEXT NOT NULL,
    delivery_attempts INTEGER NOT NULL,
    worker_id TEXT,
    original_created_at INTEGER NOT NULL,
    moved_at INTEGER NOT NULL
);

CREATE INDEX idx_outbox_dlq_moved_at ON outbox_dlq (moved_at);

CREATE TABLE outbox_dlq_replays (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dlq_entry_id TEXT NOT NULL REFERENCES outbox_dlq (id),
    new_event_id TEXT NOT NULL,
    unit_of_work_id TEXT NOT NULL,
    requested_by TEXT NOT NULL,
    replayed_at INTEGER NOT NULL
);

CREATE INDEX idx_outbox_dlq_replays_entry ON outbox_dlq_replays (dlq_entry_id);
"#;

const DLQ_DOWN: &str = r#"
DROP TABLE IF EXISTS outbox_dlq_replays;
DROP TABLE IF EXISTS outbox_dlq;
"#;

const IDEMPOTENCY_UP: &str = r#"
CREATE TABLE idempotency_keys (
    key TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    state TEXT NOT NULL CHECK (state IN ('in_flight', 'completed')),
    owner TEXT NOT NULL,
    result_payload TEXT,
    unit_of_work_id TEXT,
    receipt_id TEXT,
    created_at INTEGER NOT NULL,
    reservation_expires_at INTEGER NOT NULL,
    completed_at INTEGER,
    ttl INTEGER NOT NULL,
    expires_at INTEGER
);

CREATE INDEX idx_idempotency_keys_expiry ON idempotency_keys (state, expires_at);
"#;

const IDEMPOTENCY_DOWN: &str = r#"
DROP TABLE IF EXISTS idempotency_keys;
"#;

const LEDGER_UP: &str = r#"
CREATE TABLE write_receipts (
    id TEXT PRIMARY KEY,
    sequence INTEGER NOT NULL UNIQUE,
    unit_of_work_id TEXT NOT NULL,
    stores_affected TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    prev_receipt_hash TEXT NOT NULL,
    chain_hash TEXT NOT NULL,
    signature TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX idx_write_receipts_timestamp ON write_receipts (timestamp);

CREATE TABLE unit_of_work_log (
    id TEXT PRIMARY KEY,
    idempotency_key TEXT,
    stores_affected TEXT NOT NULL DEFAULT '[]',
    event_count INTEGER NOT NULL DEFAULT 0,
    receipt_id TEXT,
    started_at INTEGER NOT NULL,
    committed_at INTEGER
);
"#;

const LEDGER_DOWN: &str = r#"
DROP TABLE IF EXISTS unit_of_work_log;
DROP TABLE IF EXISTS write_receipts;
"#;

/// Substrate migrations, versions `1..=CORE_SCHEMA_VERSION`.
pub fn core_migrations() -> Vec<Migration> {
    vec![
        Migration::new(1, "create outbox events", OUTBOX_UP).with_down(OUTBOX_DOWN),
        Migration::new(2, "create outbox dead letter queue", DLQ_UP).with_down(DLQ_DOWN),
        Migration::new(3, "create idempotency keys", IDEMPOTENCY_UP).with_down(IDEMPOTENCY_DOWN),
        Migration::new(4, "create write receipts and unit of work log", LEDGER_UP)
            .with_down(LEDGER_DOWN),
    ]
}

/// The substrate set, ready to be extended with application migrations.
pub fn core_migration_set() -> Result<MigrationSet, MigrationError> {
    MigrationSet::new(core_migrations())
}
