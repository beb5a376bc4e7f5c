//! Unit of Work coordinator
//!
//! A [`UnitOfWork`] binds one pooled connection, the participating domain
//! stores, an optional idempotency key, staged outbox events and a receipt
//! into a single SQLite transaction.
//!
//! # Lifecycle
//!
//! ```text
//! created → active → committing → committed
//!              │          │
//!              └──────────┴→ rolling_back → rolled_back
//! any non-terminal state → failed (connection fault)
//! ```
//!
//! # Commit
//!
//! All of the following run inside one transaction, in order:
//!
//! 1. journal row in `unit_of_work_log` (takes the write lock)
//! 2. `participate` of every registered store
//! 3. staged outbox events, with per-aggregate sequence numbers
//! 4. the chained write receipt
//! 5. the idempotency result, when a key was supplied
//!
//! Any failure rolls everything back and releases the idempotency
//! reservation so the caller may retry with the same key.
//!
//! # Usage
//!
//! ```ignore
//! let key = IdempotencyKey::derive("create_memory", &request)?;
//! match factory.begin(BeginOptions::new().with_idempotency_key(key)).await? {
//!     Begun::Replayed(cached) => Ok(cached.result),
//!     Begun::Started(mut uow) => {
//!         uow.register_store(episodic)?;
//!         uow.enqueue_outbox(NewOutboxEvent::new("Memory", id, "MEMORY_CREATED", payload))?;
//!         uow.set_result(json!({"memory_id": id}))?;
//!         Ok(uow.commit().await?.result)
//!     }
//! }
//! ```

use chrono::Utc;
use memoria_shared::config::UnitOfWorkConfig;
use memoria_shared::{EventId, InFlightPolicy, UnitOfWorkId, UnitOfWorkState};
use memoria_storage_core::clock::to_millis;
use memoria_storage_core::ledger::{CommitPayload, EventDigest};
use memoria_storage_core::{
    CachedResult, IdempotencyKey, IdempotencyLookup, NewOutboxEvent, OutboxEvent,
    ParticipationContext, Result, RetryPolicy, StorageError, Store, StoreContribution,
    StoreHandle, StoreRegistry, WriteReceipt,
};
use sqlx::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::idempotency::{IdempotencyStore, Reservation};
use crate::ledger::ReceiptLedger;
use crate::metrics::StorageMetrics;
use crate::migrations::SchemaReady;
use crate::outbox::OutboxStore;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::sql;

const RELEASE_RETRY_MIN: Duration = Duration::from_millis(25);
const RELEASE_RETRY_MAX: Duration = Duration::from_secs(2);

/// Options for [`UnitOfWorkFactory::begin`]
#[derive(Debug, Clone, Default)]
pub struct BeginOptions {
    pub idempotency_key: Option<IdempotencyKey>,
    /// Operation name, for logs
    pub operation: Option<String>,
    /// Bounds the connection wait, the in-flight wait and the commit
    pub deadline: Option<Instant>,
    /// Overrides the configured in-flight policy
    pub in_flight_policy: Option<InFlightPolicy>,
    /// Overrides the configured result ttl
    pub ttl: Option<Duration>,
}

impl BeginOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_in_flight_policy(mut self, policy: InFlightPolicy) -> Self {
        self.in_flight_policy = Some(policy);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Result of [`UnitOfWorkFactory::begin`]
#[derive(Debug)]
pub enum Begun {
    /// A fresh unit of work holding an open transaction.
    Started(UnitOfWork),
    /// The key already completed; nothing was executed.
    Replayed(CachedResult),
}

impl Begun {
    pub fn is_replayed(&self) -> bool {
        matches!(self, Begun::Replayed(_))
    }

    pub fn into_started(self) -> Option<UnitOfWork> {
        match self {
            Begun::Started(uow) => Some(uow),
            Begun::Replayed(_) => None,
        }
    }
}

/// What a successful commit produced
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub unit_of_work_id: UnitOfWorkId,
    pub receipt: WriteReceipt,
    pub result: serde_json::Value,
    pub event_ids: Vec<EventId>,
}

struct FactoryInner {
    pool: ConnectionPool,
    registry: Arc<StoreRegistry>,
    idempotency: Arc<IdempotencyStore>,
    ledger: Arc<ReceiptLedger>,
    config: UnitOfWorkConfig,
    retry_policy: RetryPolicy,
    metrics: StorageMetrics,
}

/// Creates units of work. Owns the store registry; there is no global one.
#[derive(Clone)]
pub struct UnitOfWorkFactory {
    inner: Arc<FactoryInner>,
}

impl UnitOfWorkFactory {
    pub fn new(
        pool: ConnectionPool,
        registry: Arc<StoreRegistry>,
        _schema: &SchemaReady,
        idempotency: Arc<IdempotencyStore>,
        ledger: Arc<ReceiptLedger>,
        config: UnitOfWorkConfig,
        retry_policy: RetryPolicy,
    ) -> Self {
        let metrics = pool.metrics().clone();
        Self {
            inner: Arc::new(FactoryInner {
                pool,
                registry,
                idempotency,
                ledger,
                config,
                retry_policy,
                metrics,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.inner.registry
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyStore> {
        &self.inner.idempotency
    }

    /// Lease a connection, resolve the idempotency key and open a transaction.
    pub async fn begin(&self, options: BeginOptions) -> Result<Begun> {
        let inner = &self.inner;
        let id = UnitOfWorkId::new();
        let deadline = options.deadline;

        let mut conn = acquire_before(&inner.pool, deadline).await?;

        if let Some(key) = &options.idempotency_key {
            let policy = options
                .in_flight_policy
                .unwrap_or(inner.config.in_flight_policy);
            let ttl = options.ttl.unwrap_or_else(|| inner.config.idempotency_ttl());

            let resolved = resolve_key(inner, &mut conn, key, id, policy, ttl, deadline).await;
            match resolved {
                Ok(None) => {}
                Ok(Some(cached)) => {
                    conn.release().await;
                    inner.metrics.idempotency_replays.inc();
                    inner.metrics.record_unit_of_work("replayed");
                    info!(key = %key, "Idempotency key already completed, replaying cached result");
                    return Ok(Begun::Replayed(cached));
                }
                Err(e) => {
                    if e.is_connection_fault() {
                        conn.mark_broken();
                    }
                    conn.release().await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = sql::begin(&mut conn).await {
            if let Some(key) = &options.idempotency_key {
                if !release_reservation(inner, &mut conn, key, id).await {
                    spawn_release(Arc::clone(inner), key.clone(), id);
                }
            }
            if e.is_connection_fault() {
                conn.mark_broken();
            }
            conn.release().await;
            return Err(e);
        }

        debug!(
            unit_of_work_id = %id,
            operation = options.operation.as_deref().unwrap_or("-"),
            connection_id = conn.id(),
            "Unit of work started"
        );

        let ttl = options
            .ttl
            .unwrap_or_else(|| inner.config.idempotency_ttl());
        let mut uow = UnitOfWork {
            id,
            state: UnitOfWorkState::Created,
            conn: Some(conn),
            stores: Vec::new(),
            staged: Vec::new(),
            result: serde_json::Value::Null,
            idempotency_key: options.idempotency_key,
            operation: options.operation,
            ttl,
            deadline,
            factory: Arc::clone(&self.inner),
        };
        uow.transition(UnitOfWorkState::Active)?;
        Ok(Begun::Started(uow))
    }
}

impl std::fmt::Debug for UnitOfWorkFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkFactory")
            .field("registry", &self.inner.registry)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

/// One logical atomic operation. Never reused once terminal.
pub struct UnitOfWork {
    id: UnitOfWorkId,
    state: UnitOfWorkState,
    conn: Option<PooledConnection>,
    stores: Vec<Arc<dyn Store>>,
    staged: Vec<(EventId, NewOutboxEvent)>,
    result: serde_json::Value,
    idempotency_key: Option<IdempotencyKey>,
    operation: Option<String>,
    ttl: Duration,
    deadline: Option<Instant>,
    factory: Arc<FactoryInner>,
}

impl UnitOfWork {
    pub fn id(&self) -> UnitOfWorkId {
        self.id
    }

    pub fn state(&self) -> UnitOfWorkState {
        self.state
    }

    pub fn idempotency_key(&self) -> Option<&IdempotencyKey> {
        self.idempotency_key.as_ref()
    }

    /// Stores in participation order.
    pub fn participants(&self) -> Vec<&str> {
        self.stores.iter().map(|s| s.name()).collect()
    }

    pub fn staged_events(&self) -> usize {
        self.staged.len()
    }

    /// Add a registered store to the participation set. Registering the
    /// same store twice is a no-op.
    pub fn register_store(&mut self, handle: StoreHandle) -> Result<()> {
        self.ensure_active()?;
        let store = self.factory.registry.resolve(handle)?;
        self.attach_store(store);
        Ok(())
    }

    pub(crate) fn attach_store(&mut self, store: Arc<dyn Store>) {
        if !self.stores.iter().any(|s| s.name() == store.name()) {
            self.stores.push(store);
        }
    }

    /// Stage an event; it becomes durable only if the unit commits.
    pub fn enqueue_outbox(&mut self, event: NewOutboxEvent) -> Result<EventId> {
        self.ensure_active()?;
        if let Some(policy) = &event.retry_policy {
            policy.validate()?;
        }
        let event_id = EventId::new();
        self.staged.push((event_id, event));
        Ok(event_id)
    }

    /// The value cached under the idempotency key and returned by `commit`.
    pub fn set_result(&mut self, result: serde_json::Value) -> Result<()> {
        self.ensure_active()?;
        self.result = result;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<CommitOutcome> {
        let deadline = self.deadline;
        self.commit_before(deadline).await
    }

    /// Commit, giving up (and rolling back) if the write lock is not
    /// obtained within `timeout`.
    pub async fn commit_with_deadline(&mut self, timeout: Duration) -> Result<CommitOutcome> {
        let deadline = Instant::now() + timeout;
        let deadline = self.deadline.map_or(deadline, |d| d.min(deadline));
        self.commit_before(Some(deadline)).await
    }

    /// Abort. Safe from any non-terminal state, a no-op once terminal.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.transition(UnitOfWorkState::RollingBack)?;

        let mut conn = self.conn.take();
        if let Some(conn) = conn.as_mut() {
            if sql::rollback(conn).await.is_err() {
                conn.mark_broken();
            }
        }
        self.finish_rollback(conn, None).await;
        info!(unit_of_work_id = %self.id, "Unit of work rolled back");
        Ok(())
    }

    async fn commit_before(&mut self, deadline: Option<Instant>) -> Result<CommitOutcome> {
        self.transition(UnitOfWorkState::Committing)?;
        let Some(mut conn) = self.conn.take() else {
            return Err(StorageError::InvalidState {
                from: self.state,
                to: UnitOfWorkState::Committed,
            });
        };

        let journaled = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, self.journal(&mut conn)).await {
                    Ok(journaled) => journaled,
                    Err(_) => Err(StorageError::DeadlineExceeded {
                        stage: "acquiring the commit lock",
                    }),
                }
            }
            None => self.journal(&mut conn).await,
        };

        let written = match journaled {
            Ok(()) => self.write_all(&mut conn).await,
            Err(e) => Err(e),
        };
        let committed = match written {
            Ok(outcome) => sql::commit(&mut conn).await.map(|_| outcome),
            Err(e) => Err(e),
        };

        match committed {
            Ok((receipt, events)) => {
                self.transition(UnitOfWorkState::Committed)?;
                conn.release().await;
                if let Some(key) = &self.idempotency_key {
                    self.factory.idempotency.notify(key);
                }
                for store in &self.stores {
                    store.on_commit(self.id).await;
                }

                self.factory.metrics.record_unit_of_work("committed");
                info!(
                    unit_of_work_id = %self.id,
                    operation = self.operation.as_deref().unwrap_or("-"),
                    receipt_sequence = receipt.sequence,
                    stores = self.stores.len(),
                    events = events.len(),
                    "Unit of work committed"
                );

                Ok(CommitOutcome {
                    unit_of_work_id: self.id,
                    receipt,
                    result: self.result.clone(),
                    event_ids: events.iter().map(|e| e.id).collect(),
                })
            }
            Err(e) => Err(self.abort(conn, e).await),
        }
    }

    /// First statement of the commit; takes the database write lock.
    async fn journal(&self, conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO unit_of_work_log (id, idempotency_key, started_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(self.id.to_string())
        .bind(self.idempotency_key.as_ref().map(|k| k.as_str().to_string()))
        .bind(to_millis(Utc::now()))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn write_all(
        &self,
        conn: &mut SqliteConnection,
    ) -> Result<(WriteReceipt, Vec<OutboxEvent>)> {
        let now = Utc::now();

        let mut contributions: Vec<StoreContribution> = Vec::with_capacity(self.stores.len());
        for store in &self.stores {
            let mut ctx = ParticipationContext::new(self.id, &mut *conn);
            let contribution = store.participate(&mut ctx).await.map_err(|e| match e {
                StorageError::Database(inner) => StorageError::store(store.name(), inner.to_string()),
                other => other,
            })?;
            contributions.push(contribution);
        }

        let mut events = Vec::with_capacity(self.staged.len());
        for (event_id, event) in &self.staged {
            let inserted = OutboxStore::insert_in_tx(
                conn,
                self.id,
                *event_id,
                event,
                &self.factory.retry_policy,
                now,
            )
            .await?;
            events.push(inserted);
        }

        let digests = events
            .iter()
            .map(|e| {
                EventDigest::new(
                    e.id,
                    &e.aggregate_id,
                    &e.event_type,
                    e.sequence_number,
                    &e.payload,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let payload_hash = CommitPayload {
            unit_of_work_id: self.id,
            idempotency_key: self.idempotency_key.as_ref().map(|k| k.as_str()),
            stores: &contributions,
            events: &digests,
        }
        .payload_hash()?;

        let stores_affected: Vec<String> = contributions.iter().map(|c| c.store.clone()).collect();
        let receipt = self
            .factory
            .ledger
            .append_in_tx(conn, self.id, stores_affected.clone(), payload_hash)
            .await?;

        if let Some(key) = &self.idempotency_key {
            self.factory
                .idempotency
                .finalize_in_tx(conn, key, self.id, &self.result, receipt.id, self.ttl)
                .await?;
        }

        sqlx::query(
            r#"
            UPDATE unit_of_work_log
            SET stores_affected = ?1, event_count = ?2, receipt_id = ?3, committed_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(serde_json::to_string(&stores_affected)?)
        .bind(events.len() as i64)
        .bind(receipt.id.to_string())
        .bind(to_millis(now))
        .bind(self.id.to_string())
        .execute(&mut *conn)
        .await?;

        Ok((receipt, events))
    }

    /// Roll back a failed commit and return the error to surface.
    async fn abort(&mut self, mut conn: PooledConnection, error: StorageError) -> StorageError {
        let fault = error.is_connection_fault();
        if fault {
            let _ = self.transition(UnitOfWorkState::Failed);
        } else {
            let _ = self.transition(UnitOfWorkState::RollingBack);
        }

        if fault || matches!(error, StorageError::DeadlineExceeded { .. }) {
            // the cancelled statement may still be running on this connection;
            // closing it discards the transaction
            conn.mark_broken();
        } else if sql::rollback(&mut conn).await.is_err() {
            conn.mark_broken();
        }

        self.finish_rollback(Some(conn), Some(&error)).await;

        let outcome = match &error {
            StorageError::TransactionConflict { .. } => "conflict",
            _ if fault => "failed",
            _ => "rolled_back",
        };
        self.factory.metrics.record_unit_of_work(outcome);
        warn!(
            unit_of_work_id = %self.id,
            operation = self.operation.as_deref().unwrap_or("-"),
            retryable = error.is_retryable(),
            error = %error,
            "Unit of work commit failed"
        );
        error
    }

    /// Release the reservation and the connection, then run rollback hooks.
    async fn finish_rollback(&mut self, conn: Option<PooledConnection>, error: Option<&StorageError>) {
        let mut detached = false;
        if let Some(mut conn) = conn {
            if let Some(key) = &self.idempotency_key {
                if conn.is_broken()
                    || !release_reservation(&self.factory, &mut conn, key, self.id).await
                {
                    // a competing writer may still hold the lock
                    detached = true;
                } else {
                    self.factory.idempotency.notify(key);
                }
            }
            conn.release().await;
        }
        if detached {
            if let Some(key) = self.idempotency_key.clone() {
                spawn_release(Arc::clone(&self.factory), key, self.id);
            }
        }

        for store in &self.stores {
            store.on_rollback(self.id).await;
        }

        if self.state == UnitOfWorkState::RollingBack {
            let _ = self.transition(UnitOfWorkState::RolledBack);
        }
        if error.is_none() {
            self.factory.metrics.record_unit_of_work("rolled_back");
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == UnitOfWorkState::Active {
            Ok(())
        } else {
            Err(StorageError::InvalidState {
                from: self.state,
                to: UnitOfWorkState::Active,
            })
        }
    }

    fn transition(&mut self, next: UnitOfWorkState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(StorageError::InvalidState {
                from: self.state,
                to: next,
            });
        }
        debug!(unit_of_work_id = %self.id, from = %self.state, to = %next, "Unit of work transition");
        self.state = next;
        Ok(())
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if !self.state.holds_transaction() {
            return;
        }

        warn!(unit_of_work_id = %self.id, state = %self.state, "Unit of work dropped while active, rolling back");
        let id = self.id;
        let key = self.idempotency_key.take();
        let factory = Arc::clone(&self.factory);
        let stores = std::mem::take(&mut self.stores);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if sql::rollback(&mut conn).await.is_err() {
                        conn.mark_broken();
                    }
                    let mut deferred = conn.is_broken();
                    if let Some(key) = &key {
                        if !deferred {
                            if release_reservation(&factory, &mut conn, key, id).await {
                                factory.idempotency.notify(key);
                            } else {
                                deferred = true;
                            }
                        }
                    }
                    conn.release().await;
                    if deferred {
                        if let Some(key) = key {
                            spawn_release(Arc::clone(&factory), key, id);
                        }
                    }
                    for store in &stores {
                        store.on_rollback(id).await;
                    }
                    factory.metrics.record_unit_of_work("rolled_back");
                });
            }
            Err(_) => {
                // closing the connection discards the open transaction
                conn.mark_broken();
            }
        }
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("stores", &self.participants())
            .field("staged_events", &self.staged.len())
            .field("idempotency_key", &self.idempotency_key)
            .finish()
    }
}

async fn acquire_before(pool: &ConnectionPool, deadline: Option<Instant>) -> Result<PooledConnection> {
    let configured = pool.config().acquire_timeout;
    let Some(deadline) = deadline else {
        return pool.acquire().await;
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining < configured {
        return match pool.acquire_timeout(remaining).await {
            Err(StorageError::PoolExhausted { .. }) => Err(StorageError::DeadlineExceeded {
                stage: "waiting for a connection",
            }),
            other => other,
        };
    }
    pool.acquire().await
}

/// Reserve `key` or resolve it to a cached result. `Ok(None)` means the
/// caller now owns the key.
async fn resolve_key(
    inner: &FactoryInner,
    conn: &mut PooledConnection,
    key: &IdempotencyKey,
    owner: UnitOfWorkId,
    policy: InFlightPolicy,
    ttl: Duration,
    deadline: Option<Instant>,
) -> Result<Option<CachedResult>> {
    let lease = inner.config.reservation_lease();
    loop {
        match inner
            .idempotency
            .reserve(conn, key, owner, lease, ttl)
            .await?
        {
            Reservation::Reserved => return Ok(None),
            Reservation::Cached(cached) => return Ok(Some(cached)),
            Reservation::InFlight { owner: holder, .. } => {
                if policy == InFlightPolicy::Fail {
                    debug!(key = %key, holder = %holder, "Idempotency key in flight, failing fast");
                    return Err(StorageError::IdempotencyInFlight {
                        key: key.to_string(),
                    });
                }

                let configured = inner.config.in_flight_timeout();
                let (wait, deadline_bound) = match deadline {
                    Some(d) => {
                        let remaining = d.saturating_duration_since(Instant::now());
                        (remaining.min(configured), remaining < configured)
                    }
                    None => (configured, false),
                };

                debug!(key = %key, holder = %holder, wait_ms = wait.as_millis() as u64, "Waiting for in-flight result");
                match inner.idempotency.wait_for(conn, key, wait).await {
                    Ok(IdempotencyLookup::Cached(cached)) => return Ok(Some(cached)),
                    // the holder rolled back or its reservation expired
                    Ok(_) => continue,
                    Err(StorageError::IdempotencyInFlight { .. }) if deadline_bound => {
                        return Err(StorageError::DeadlineExceeded {
                            stage: "waiting for an in-flight result",
                        })
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

/// Drop the reservation on `conn`. Returns `false` when the delete failed
/// and the row may still be in flight.
async fn release_reservation(
    inner: &FactoryInner,
    conn: &mut SqliteConnection,
    key: &IdempotencyKey,
    owner: UnitOfWorkId,
) -> bool {
    match inner.idempotency.release(conn, key, owner).await {
        Ok(_) => true,
        Err(e) => {
            warn!(key = %key, unit_of_work_id = %owner, error = %e, "Failed to release idempotency reservation");
            false
        }
    }
}

/// Release a reservation on a fresh connection, off the caller's path.
///
/// Retries with backoff until the delete succeeds or the reservation lease
/// runs out, at which point the row can be taken over anyway.
fn spawn_release(factory: Arc<FactoryInner>, key: IdempotencyKey, owner: UnitOfWorkId) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(key = %key, unit_of_work_id = %owner, "No runtime, reservation left to expire");
        return;
    };
    handle.spawn(async move {
        let give_up = Instant::now() + factory.config.reservation_lease();
        let mut delay = RELEASE_RETRY_MIN;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let released = match factory.pool.acquire().await {
                Ok(mut conn) => {
                    let ok = release_reservation(&factory, &mut conn, &key, owner).await;
                    conn.release().await;
                    ok
                }
                Err(e) => {
                    debug!(key = %key, unit_of_work_id = %owner, error = %e, "No connection to release reservation");
                    false
                }
            };
            if released {
                if attempts > 1 {
                    debug!(key = %key, unit_of_work_id = %owner, attempts, "Deferred reservation release succeeded");
                }
                break;
            }
            if Instant::now() + delay >= give_up {
                warn!(key = %key, unit_of_work_id = %owner, attempts, "Reservation left to expire");
                break;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(RELEASE_RETRY_MAX);
        }
        factory.idempotency.notify(&key);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_options_builder() {
        let key = IdempotencyKey::from_raw("create-memory-123");
        let options = BeginOptions::new()
            .with_idempotency_key(key.clone())
            .with_operation("create_memory")
            .with_in_flight_policy(InFlightPolicy::Fail)
            .with_ttl(Duration::from_secs(60))
            .with_timeout(Duration::from_secs(1));

        assert_eq!(options.idempotency_key, Some(key));
        assert_eq!(options.operation.as_deref(), Some("create_memory"));
        assert_eq!(options.in_flight_policy, Some(InFlightPolicy::Fail));
        assert_eq!(options.ttl, Some(Duration::from_secs(60)));
        assert!(options.deadline.is_some());
    }
}
