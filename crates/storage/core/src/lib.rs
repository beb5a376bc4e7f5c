//! Domain models and ports of the Memoria storage substrate.
//!
//! This crate holds everything that does not need a live database: the
//! error taxonomy, the [`store::Store`] capability and its registry, outbox
//! and dead-letter models, retry policy, idempotency keys, the receipt hash
//! chain and migration bookkeeping. The SQLite adapters live in
//! `memoria-storage-sqlite`.

pub mod canonical;
pub mod clock;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod migration;
pub mod outbox;
pub mod store;

pub use error::{Result, StorageError};
pub use idempotency::{CachedResult, IdempotencyKey, IdempotencyLookup, IdempotencyStats};
pub use ledger::{
    ChainAnchor, ChainEntry, Ed25519ReceiptSigner, Hash256, IntegrityReport, ReceiptSigner,
    UndecodableReceipt, WriteReceipt, GENESIS_CHAIN_HASH,
};
pub use migration::{AppliedMigration, Migration, MigrationError, MigrationResult, MigrationSet};
pub use outbox::{
    DeliveryStatus, DlqEntry, DlqReason, EventTransport, NewOutboxEvent, OutboxEvent, RetryPolicy,
    TransportError, TransportMessage,
};
pub use store::{ParticipationContext, Store, StoreContribution, StoreHandle, StoreRegistry};
