//! SQLite adapters of the Memoria storage substrate.
//!
//! - [`pool`]: bounded connection pool with health-checked return
//! - [`unit_of_work`]: atomic multi-store commits with idempotency and receipts
//! - [`idempotency`]: reservation and replay of idempotency keys
//! - [`outbox`]: transactional outbox, dead-letter queue and delivery worker
//! - [`migrations`]: versioned schema migrations under an advisory lock
//! - [`ledger`]: chained, signed write receipts
//! - [`runtime`]: one-call bootstrap wiring all of the above

pub mod idempotency;
pub mod ledger;
pub mod maintenance;
pub mod metrics;
pub mod migrations;
pub mod outbox;
pub mod pool;
pub mod runtime;
pub mod schema;
pub mod telemetry;
pub mod unit_of_work;

mod sql;

pub use idempotency::{IdempotencyStore, Reservation};
pub use ledger::ReceiptLedger;
pub use maintenance::{MaintenanceConfig, MaintenanceResult, MaintenanceTask};
pub use metrics::StorageMetrics;
pub use migrations::{MigrationReport, MigrationRunner, SchemaReady};
pub use outbox::{
    DeadLetterQueue, FailureOutcome, OutboxStore, OutboxWorker, OutboxWorkerMetricsSnapshot,
    OutboxWorkerPool,
};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use runtime::{RuntimeError, StorageRuntime};
pub use unit_of_work::{BeginOptions, Begun, CommitOutcome, UnitOfWork, UnitOfWorkFactory};
