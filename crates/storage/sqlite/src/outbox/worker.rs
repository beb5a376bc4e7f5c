//! Outbox Worker
//!
//! Background service that leases ready outbox events, publishes them to
//! the event transport and records the outcome.
//!
//! ```text
//! ┌──────────────┐  claim_batch   ┌──────────────┐  publish   ┌───────────┐
//! │ outbox_events│ ─────────────▶ │ OutboxWorker │ ─────────▶ │ Transport │
//! └──────────────┘                └──────┬───────┘            └───────────┘
//!        ▲   mark_delivered / retry      │ exhausted / permanent / poison
//!        └───────────────────────────────┤
//!                                        ▼
//!                                 ┌──────────────┐    ┌───────────┐
//!                                 │  outbox_dlq  │ ─▶ │ AlertSink │
//!                                 └──────────────┘    └───────────┘
//! ```
//!
//! Events of one aggregate are published strictly in sequence order: the
//! lease covers a run of consecutive events, the run is published one by
//! one, and the first failure hands the rest of the run back untouched.
//! Different aggregates are published concurrently.

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use memoria_shared::config::OutboxConfig;
use memoria_shared::EventId;
use memoria_storage_core::outbox::{AlertSink, Jitter, PayloadValidator};
use memoria_storage_core::{
    DlqEntry, DlqReason, EventTransport, OutboxEvent, Result, TransportError, TransportMessage,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::store::{FailureOutcome, OutboxStore};
use crate::migrations::SchemaReady;

/// Counters of a single worker, readable while it runs.
#[derive(Debug, Default)]
pub struct OutboxWorkerMetrics {
    batches: AtomicU64,
    leased: AtomicU64,
    published: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    released: AtomicU64,
    leases_lost: AtomicU64,
    errors: AtomicU64,
    publish_duration_ms_sum: AtomicU64,
}

/// Point-in-time copy of [`OutboxWorkerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxWorkerMetricsSnapshot {
    pub batches: u64,
    pub leased: u64,
    pub published: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub released: u64,
    pub leases_lost: u64,
    pub errors: u64,
    pub publish_duration_ms_sum: u64,
}

impl OutboxWorkerMetricsSnapshot {
    pub fn avg_publish_duration_ms(&self) -> f64 {
        if self.published == 0 {
            0.0
        } else {
            self.publish_duration_ms_sum as f64 / self.published as f64
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.batches += other.batches;
        self.leased += other.leased;
        self.published += other.published;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.released += other.released;
        self.leases_lost += other.leases_lost;
        self.errors += other.errors;
        self.publish_duration_ms_sum += other.publish_duration_ms_sum;
        self
    }
}

impl OutboxWorkerMetrics {
    pub fn snapshot(&self) -> OutboxWorkerMetricsSnapshot {
        OutboxWorkerMetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            leased: self.leased.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            leases_lost: self.leases_lost.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            publish_duration_ms_sum: self.publish_duration_ms_sum.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// What happened to one event during a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Published,
    Retrying,
    DeadLettered,
    LeaseLost,
}

impl Delivery {
    /// Whether later events of the same aggregate may still go out.
    fn continues_run(self) -> bool {
        matches!(self, Delivery::Published)
    }
}

/// Drains the outbox into an [`EventTransport`].
pub struct OutboxWorker {
    worker_id: String,
    store: OutboxStore,
    transport: Arc<dyn EventTransport>,
    validator: Arc<dyn PayloadValidator>,
    alerts: Arc<dyn AlertSink>,
    config: OutboxConfig,
    jitter: Jitter,
    metrics: Arc<OutboxWorkerMetrics>,
    shutdown: broadcast::Sender<()>,
    stopping: AtomicBool,
}

impl OutboxWorker {
    pub fn new(
        store: OutboxStore,
        _schema: &SchemaReady,
        transport: Arc<dyn EventTransport>,
        config: OutboxConfig,
        validator: Arc<dyn PayloadValidator>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            worker_id: format!("outbox-worker-{}", uuid::Uuid::new_v4()),
            store,
            transport,
            validator,
            alerts,
            jitter: Jitter::new(config.jitter),
            config,
            metrics: Arc::new(OutboxWorkerMetrics::default()),
            shutdown,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn metrics(&self) -> OutboxWorkerMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Poll until [`shutdown`](Self::shutdown) is called.
    ///
    /// A batch in progress is finished before the loop exits; no new
    /// leases are taken afterwards.
    pub async fn run(&self) {
        info!(
            worker_id = %self.worker_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            "Starting outbox worker"
        );

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown.subscribe();

        while !self.stopping.load(Ordering::Acquire) {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!(worker_id = %self.worker_id, "Outbox worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.process_batch().await {
                        // a full batch means more work is likely waiting
                        Ok(n) if n >= self.config.batch_size as usize => ticker.reset_immediately(),
                        Ok(_) => {}
                        Err(e) => {
                            OutboxWorkerMetrics::add(&self.metrics.errors, 1);
                            error!(worker_id = %self.worker_id, error = %e, "Outbox batch failed");
                        }
                    }
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        info!(
            worker_id = %self.worker_id,
            published = snapshot.published,
            retried = snapshot.retried,
            dead_lettered = snapshot.dead_lettered,
            "Outbox worker stopped"
        );
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        let _ = self.shutdown.send(());
    }

    /// Lease and process one batch. Returns the number of leased events.
    pub async fn process_batch(&self) -> Result<usize> {
        let events = self
            .store
            .claim_batch(
                &self.worker_id,
                self.config.batch_size,
                self.config.lease_duration(),
            )
            .await?;
        if events.is_empty() {
            return Ok(0);
        }

        let leased = events.len();
        OutboxWorkerMetrics::add(&self.metrics.batches, 1);
        OutboxWorkerMetrics::add(&self.metrics.leased, leased as u64);
        debug!(worker_id = %self.worker_id, leased, "Processing outbox batch");

        let mut runs: FuturesUnordered<_> = group_by_aggregate(events)
            .into_iter()
            .map(|run| self.process_run(run))
            .collect();
        while runs.next().await.is_some() {}

        Ok(leased)
    }

    /// Publish one aggregate's run in order, stopping at the first failure.
    async fn process_run(&self, run: Vec<OutboxEvent>) {
        let mut remaining = run.into_iter();
        while let Some(event) = remaining.next() {
            let delivery = match self.deliver(&event).await {
                Ok(delivery) => delivery,
                Err(e) => {
                    OutboxWorkerMetrics::add(&self.metrics.errors, 1);
                    error!(
                        worker_id = %self.worker_id,
                        event_id = %event.id,
                        error = %e,
                        "Failed to record outbox delivery outcome"
                    );
                    // the lease expires on its own and the event is retried
                    Delivery::LeaseLost
                }
            };
            if delivery.continues_run() {
                continue;
            }

            let rest: Vec<EventId> = remaining.map(|e| e.id).collect();
            if !rest.is_empty() {
                match self.store.release_leases(&rest, &self.worker_id).await {
                    Ok(n) => OutboxWorkerMetrics::add(&self.metrics.released, n),
                    Err(e) => warn!(
                        worker_id = %self.worker_id,
                        aggregate_id = %event.aggregate_id,
                        error = %e,
                        "Failed to release remaining leases"
                    ),
                }
            }
            return;
        }
    }

    async fn deliver(&self, event: &OutboxEvent) -> Result<Delivery> {
        if let Err(reason) = self.validator.validate(event) {
            warn!(event_id = %event.id, error = %reason, "Outbox event failed validation");
            let attempts = event.delivery_attempts + 1;
            let entry = self
                .store
                .move_to_dlq(
                    event,
                    attempts,
                    DlqReason::SchemaValidationFailed,
                    &reason,
                    &self.worker_id,
                )
                .await?;
            return Ok(self.dead_lettered(event, entry).await);
        }

        let message = TransportMessage::from_event(event);
        let started = Instant::now();
        let published = tokio::time::timeout(
            self.config.publish_timeout(),
            self.transport.publish(&message),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match published {
            Ok(Ok(())) => {
                if self.store.mark_delivered(event.id, &self.worker_id).await? {
                    OutboxWorkerMetrics::add(&self.metrics.published, 1);
                    OutboxWorkerMetrics::add(&self.metrics.publish_duration_ms_sum, elapsed_ms);
                    debug!(
                        worker_id = %self.worker_id,
                        event_id = %event.id,
                        aggregate_id = %event.aggregate_id,
                        sequence_number = event.sequence_number,
                        elapsed_ms,
                        "Outbox event published"
                    );
                    Ok(Delivery::Published)
                } else {
                    OutboxWorkerMetrics::add(&self.metrics.leases_lost, 1);
                    Ok(Delivery::LeaseLost)
                }
            }
            Ok(Err(TransportError::Transient(message))) => {
                self.retry_or_dead_letter(event, &message, DlqReason::MaxRetriesExceeded)
                    .await
            }
            Ok(Err(TransportError::Permanent(message))) => {
                self.dead_letter_now(event, DlqReason::PermanentFailure, &message)
                    .await
            }
            Ok(Err(TransportError::Poison(message))) => {
                self.dead_letter_now(event, DlqReason::PoisonMessage, &message)
                    .await
            }
            Err(_) => {
                let message = format!(
                    "publish timed out after {}ms",
                    self.config.publish_timeout_ms
                );
                self.retry_or_dead_letter(event, &message, DlqReason::ProcessingTimeout)
                    .await
            }
        }
    }

    async fn retry_or_dead_letter(
        &self,
        event: &OutboxEvent,
        error: &str,
        exhausted_reason: DlqReason,
    ) -> Result<Delivery> {
        let outcome = self
            .store
            .record_failure(event, &self.worker_id, error, self.jitter, exhausted_reason)
            .await?;

        Ok(match outcome {
            FailureOutcome::Retrying { .. } => {
                OutboxWorkerMetrics::add(&self.metrics.retried, 1);
                Delivery::Retrying
            }
            FailureOutcome::DeadLettered(entry) => self.dead_lettered(event, Some(entry)).await,
            FailureOutcome::LeaseLost => {
                OutboxWorkerMetrics::add(&self.metrics.leases_lost, 1);
                Delivery::LeaseLost
            }
        })
    }

    async fn dead_letter_now(
        &self,
        event: &OutboxEvent,
        reason: DlqReason,
        error: &str,
    ) -> Result<Delivery> {
        let entry = self
            .store
            .move_to_dlq(
                event,
                event.delivery_attempts + 1,
                reason,
                error,
                &self.worker_id,
            )
            .await?;
        Ok(self.dead_lettered(event, entry).await)
    }

    async fn dead_lettered(&self, event: &OutboxEvent, entry: Option<DlqEntry>) -> Delivery {
        match entry {
            Some(entry) => {
                OutboxWorkerMetrics::add(&self.metrics.dead_lettered, 1);
                self.alerts.dead_lettered(&entry).await;
                Delivery::DeadLettered
            }
            None => {
                debug!(event_id = %event.id, "Lease lost before dead-lettering");
                OutboxWorkerMetrics::add(&self.metrics.leases_lost, 1);
                Delivery::LeaseLost
            }
        }
    }
}

impl std::fmt::Debug for OutboxWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxWorker")
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .finish()
    }
}

/// Split a claimed batch (sorted by aggregate, then sequence) into per-aggregate runs.
fn group_by_aggregate(events: Vec<OutboxEvent>) -> Vec<Vec<OutboxEvent>> {
    let mut runs: Vec<Vec<OutboxEvent>> = Vec::new();
    for event in events {
        match runs.last_mut() {
            Some(run) if run[0].aggregate_id == event.aggregate_id => run.push(event),
            _ => runs.push(vec![event]),
        }
    }
    runs
}

/// N workers with distinct ids sharing one store and transport.
pub struct OutboxWorkerPool {
    workers: Vec<Arc<OutboxWorker>>,
    handles: Vec<JoinHandle<()>>,
}

impl OutboxWorkerPool {
    /// Spawn `count` workers on the current runtime.
    pub fn spawn(
        count: usize,
        store: OutboxStore,
        schema: &SchemaReady,
        transport: Arc<dyn EventTransport>,
        config: OutboxConfig,
        validator: Arc<dyn PayloadValidator>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let count = count.max(1);
        let prefix = uuid::Uuid::new_v4().simple().to_string();
        let mut workers = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let worker = Arc::new(
                OutboxWorker::new(
                    store.clone(),
                    schema,
                    Arc::clone(&transport),
                    config.clone(),
                    Arc::clone(&validator),
                    Arc::clone(&alerts),
                )
                .with_worker_id(format!("outbox-worker-{}-{}", &prefix[..8], index)),
            );
            let runner = Arc::clone(&worker);
            handles.push(tokio::spawn(async move { runner.run().await }));
            workers.push(worker);
        }

        info!(workers = count, "Outbox worker pool started");
        Self { workers, handles }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn worker_ids(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.worker_id()).collect()
    }

    /// Combined counters of every worker.
    pub fn metrics(&self) -> OutboxWorkerMetricsSnapshot {
        self.workers
            .iter()
            .map(|w| w.metrics())
            .fold(OutboxWorkerMetricsSnapshot::default(), |acc, m| acc.merge(m))
    }

    /// Signal every worker and wait for in-flight batches, up to `grace`.
    pub async fn shutdown(self, grace: Duration) {
        for worker in &self.workers {
            worker.shutdown();
        }

        let joined = tokio::time::timeout(grace, futures::future::join_all(self.handles)).await;
        match joined {
            Ok(results) => {
                for result in results.into_iter().filter_map(|r| r.err()) {
                    error!(error = %result, "Outbox worker task failed");
                }
                info!("Outbox worker pool stopped");
            }
            Err(_) => warn!(grace_ms = grace.as_millis() as u64, "Outbox workers did not stop in time"),
        }
    }
}

impl std::fmt::Debug for OutboxWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxWorkerPool")
            .field("workers", &self.worker_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use memoria_storage_core::{DeliveryStatus, RetryPolicy};
    use serde_json::json;

    fn event(aggregate_id: &str, sequence_number: i64) -> OutboxEvent {
        let now = Utc::now();
        OutboxEvent {
            id: EventId::new(),
            unit_of_work_id: None,
            aggregate_id: aggregate_id.into(),
            aggregate_type: "Memory".into(),
            event_type: "MEMORY_CREATED".into(),
            payload: json!({}),
            event_metadata: None,
            sequence_number,
            created_at: now,
            delivery_attempts: 0,
            delivery_status: DeliveryStatus::Processing,
            first_attempt_at: None,
            last_attempt_at: None,
            next_retry_at: now,
            delivered_at: None,
            target_topic: "memoria.memory".into(),
            partition_key: aggregate_id.into(),
            retry_policy: RetryPolicy::default(),
            last_error: None,
            lease_owner: Some("w".into()),
            lease_expires_at: None,
        }
    }

    #[test]
    fn test_group_by_aggregate_keeps_order() {
        let runs = group_by_aggregate(vec![
            event("a", 1),
            event("a", 2),
            event("b", 7),
            event("c", 1),
            event("c", 2),
        ]);

        let shape: Vec<(String, Vec<i64>)> = runs
            .iter()
            .map(|run| {
                (
                    run[0].aggregate_id.clone(),
                    run.iter().map(|e| e.sequence_number).collect(),
                )
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                ("a".to_string(), vec![1, 2]),
                ("b".to_string(), vec![7]),
                ("c".to_string(), vec![1, 2]),
            ]
        );
    }

    #[test]
    fn test_only_published_continues_run() {
        assert!(Delivery::Published.continues_run());
        assert!(!Delivery::Retrying.continues_run());
        assert!(!Delivery::DeadLettered.continues_run());
        assert!(!Delivery::LeaseLost.continues_run());
    }

    #[test]
    fn test_snapshot_merge_and_average() {
        let metrics = OutboxWorkerMetrics::default();
        OutboxWorkerMetrics::add(&metrics.published, 2);
        OutboxWorkerMetrics::add(&metrics.publish_duration_ms_sum, 30);

        let merged = metrics.snapshot().merge(metrics.snapshot());
        assert_eq!(merged.published, 4);
        assert_eq!(merged.avg_publish_duration_ms(), 15.0);
        assert_eq!(OutboxWorkerMetricsSnapshot::default().avg_publish_duration_ms(), 0.0);
    }
}
