//! Transactional outbox: table access, dead-letter queue and the delivery worker.

mod dlq;
mod store;
mod worker;

pub use dlq::DeadLetterQueue;
pub use store::{FailureOutcome, OutboxStore};
pub use worker::{
    OutboxWorker, OutboxWorkerMetrics, OutboxWorkerMetricsSnapshot, OutboxWorkerPool,
};
