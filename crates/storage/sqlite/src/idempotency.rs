//! Idempotency records
//!
//! One row per key in `idempotency_keys`, either `in_flight` (reserved by a
//! running unit of work) or `completed` (holding the cached result).
//!
//! - `reserve` is a single conditional upsert, so exactly one concurrent
//!   caller wins a key. Expired reservations (crashed owners) and expired
//!   results can be taken over
//! - `finalize_in_tx` runs inside the owning commit; the result becomes
//!   visible with the business writes or not at all
//! - `release` drops a reservation when its unit rolls back
//! - waiters poll the row and are woken early, in-process, through a
//!   per-key [`Notify`]

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use memoria_shared::{ReceiptId, UnitOfWorkId};
use memoria_storage_core::clock::{duration_millis, from_millis, to_millis};
use memoria_storage_core::{
    CachedResult, IdempotencyKey, IdempotencyLookup, IdempotencyStats, Result, StorageError,
};
use sqlx::{Row, SqliteConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::StorageMetrics;
use crate::sql::{parse_id, parse_json};

const STATE_IN_FLIGHT: &str = "in_flight";
const STATE_COMPLETED: &str = "completed";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const RESERVE_ATTEMPTS: usize = 3;

/// Outcome of a reservation attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The caller owns the key until it finalizes or releases it.
    Reserved,
    /// A completed result exists and has not expired.
    Cached(CachedResult),
    /// Another unit of work holds the key.
    InFlight {
        owner: UnitOfWorkId,
        reserved_at: DateTime<Utc>,
    },
}

pub struct IdempotencyStore {
    waiters: DashMap<String, Arc<Notify>>,
    poll_interval: Duration,
    metrics: StorageMetrics,
}

impl IdempotencyStore {
    pub fn new(metrics: StorageMetrics) -> Self {
        Self {
            waiters: DashMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            metrics,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Current state of `key` as seen at `now`. Expired rows read as absent.
    pub async fn lookup(
        &self,
        conn: &mut SqliteConnection,
        key: &IdempotencyKey,
    ) -> Result<IdempotencyLookup> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            SELECT key, scope, state, owner, result_payload, unit_of_work_id, receipt_id,
                   created_at, reservation_expires_at, expires_at
            FROM idempotency_keys
            WHERE key = ?1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(IdempotencyLookup::Absent);
        };

        let state: String = row.try_get("state")?;
        let created_at = from_millis(row.try_get("created_at")?);
        match state.as_str() {
            STATE_IN_FLIGHT => {
                let reservation_expires_at = from_millis(row.try_get("reservation_expires_at")?);
                if reservation_expires_at <= now {
                    return Ok(IdempotencyLookup::Absent);
                }
                let owner: String = row.try_get("owner")?;
                Ok(IdempotencyLookup::InFlight {
                    owner: parse_id("owner", &owner, UnitOfWorkId::from_string)?,
                    reserved_at: created_at,
                })
            }
            STATE_COMPLETED => {
                let expires_at = row
                    .try_get::<Option<i64>, _>("expires_at")?
                    .map(from_millis)
                    .unwrap_or(created_at);
                if expires_at <= now {
                    return Ok(IdempotencyLookup::Absent);
                }

                let result = match row.try_get::<Option<String>, _>("result_payload")? {
                    Some(payload) => parse_json("result_payload", &payload)?,
                    None => serde_json::Value::Null,
                };
                let unit_of_work_id = row
                    .try_get::<Option<String>, _>("unit_of_work_id")?
                    .map(|id| parse_id("unit_of_work_id", &id, UnitOfWorkId::from_string))
                    .transpose()?;
                let receipt_id = row
                    .try_get::<Option<String>, _>("receipt_id")?
                    .map(|id| parse_id("receipt_id", &id, ReceiptId::from_string))
                    .transpose()?;

                Ok(IdempotencyLookup::Cached(CachedResult {
                    key: row.try_get("key")?,
                    scope: row.try_get("scope")?,
                    result,
                    unit_of_work_id,
                    receipt_id,
                    created_at,
                    expires_at,
                }))
            }
            other => Err(crate::sql::decode_error("state", other)),
        }
    }

    /// Atomically mark `key` in flight for `owner`.
    ///
    /// Runs in autocommit mode so concurrent callers observe the winner
    /// before the winner's unit of work commits.
    pub async fn reserve(
        &self,
        conn: &mut SqliteConnection,
        key: &IdempotencyKey,
        owner: UnitOfWorkId,
        reservation_lease: Duration,
        ttl: Duration,
    ) -> Result<Reservation> {
        for _ in 0..RESERVE_ATTEMPTS {
            let now = Utc::now();
            let now_ms = to_millis(now);
            let claimed = sqlx::query(
                r#"
                INSERT INTO idempotency_keys
                    (key, scope, state, owner, created_at, reservation_expires_at, ttl)
                VALUES (?1, ?2, 'in_flight', ?3, ?4, ?5, ?6)
                ON CONFLICT (key) DO UPDATE SET
                    scope = excluded.scope,
                    state = 'in_flight',
                    owner = excluded.owner,
                    result_payload = NULL,
                    unit_of_work_id = NULL,
                    receipt_id = NULL,
                    created_at = excluded.created_at,
                    reservation_expires_at = excluded.reservation_expires_at,
                    completed_at = NULL,
                    ttl = excluded.ttl,
                    expires_at = NULL
                WHERE (idempotency_keys.state = 'in_flight'
                        AND idempotency_keys.reservation_expires_at <= ?4)
                   OR (idempotency_keys.state = 'completed'
                        AND idempotency_keys.expires_at <= ?4)
                "#,
            )
            .bind(key.as_str())
            .bind(key.scope())
            .bind(owner.to_string())
            .bind(now_ms)
            .bind(now_ms + duration_millis(reservation_lease))
            .bind(ttl.as_secs() as i64)
            .execute(&mut *conn)
            .await?;

            if claimed.rows_affected() == 1 {
                debug!(key = %key, unit_of_work_id = %owner, "Idempotency key reserved");
                return Ok(Reservation::Reserved);
            }

            match self.lookup(conn, key).await? {
                IdempotencyLookup::Cached(cached) => return Ok(Reservation::Cached(cached)),
                IdempotencyLookup::InFlight { owner, reserved_at } => {
                    return Ok(Reservation::InFlight { owner, reserved_at })
                }
                // expired between the upsert and the read; try again
                IdempotencyLookup::Absent => continue,
            }
        }

        Err(StorageError::TransactionConflict {
            message: format!("idempotency key {} changed state during reservation", key),
        })
    }

    /// Store the result for a reserved key. Must run inside the owning commit.
    pub async fn finalize_in_tx(
        &self,
        conn: &mut SqliteConnection,
        key: &IdempotencyKey,
        owner: UnitOfWorkId,
        result: &serde_json::Value,
        receipt_id: ReceiptId,
        ttl: Duration,
    ) -> Result<()> {
        let now_ms = to_millis(Utc::now());
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET state = 'completed',
                result_payload = ?1,
                unit_of_work_id = ?2,
                receipt_id = ?3,
                completed_at = ?4,
                ttl = ?5,
                expires_at = ?6
            WHERE key = ?7 AND state = 'in_flight' AND owner = ?2
            "#,
        )
        .bind(serde_json::to_string(result)?)
        .bind(owner.to_string())
        .bind(receipt_id.to_string())
        .bind(now_ms)
        .bind(ttl.as_secs() as i64)
        .bind(now_ms + duration_millis(ttl))
        .bind(key.as_str())
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() != 1 {
            warn!(key = %key, unit_of_work_id = %owner, "Reservation lost before finalize");
            return Err(StorageError::TransactionConflict {
                message: format!("reservation for idempotency key {} was lost", key),
            });
        }
        Ok(())
    }

    /// Drop `owner`'s reservation. Returns whether a row was removed.
    pub async fn release(
        &self,
        conn: &mut SqliteConnection,
        key: &IdempotencyKey,
        owner: UnitOfWorkId,
    ) -> Result<bool> {
        let released = sqlx::query(
            "DELETE FROM idempotency_keys WHERE key = ?1 AND owner = ?2 AND state = 'in_flight'",
        )
        .bind(key.as_str())
        .bind(owner.to_string())
        .execute(&mut *conn)
        .await?;

        let removed = released.rows_affected() == 1;
        if removed {
            debug!(key = %key, unit_of_work_id = %owner, "Idempotency reservation released");
        }
        Ok(removed)
    }

    /// Wake in-process waiters on `key`.
    pub fn notify(&self, key: &IdempotencyKey) {
        if let Some((_, notify)) = self.waiters.remove(key.as_str()) {
            notify.notify_waiters();
        }
    }

    /// Wait until `key` is no longer in flight, or fail with
    /// [`StorageError::IdempotencyInFlight`] after `timeout`.
    pub async fn wait_for(
        &self,
        conn: &mut SqliteConnection,
        key: &IdempotencyKey,
        timeout: Duration,
    ) -> Result<IdempotencyLookup> {
        let deadline = Instant::now() + timeout;
        let _waiting = WaiterGuard {
            waiters: &self.waiters,
            key: key.as_str(),
        };
        loop {
            let notify = self
                .waiters
                .entry(key.as_str().to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone();
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let lookup = self.lookup(conn, key).await?;
            if !matches!(lookup, IdempotencyLookup::InFlight { .. }) {
                return Ok(lookup);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StorageError::IdempotencyInFlight {
                    key: key.to_string(),
                });
            }
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Keys with a waiter registration, for diagnostics.
    pub fn waiting_keys(&self) -> usize {
        self.waiters.len()
    }

    /// Delete completed records whose ttl elapsed before `now`, and
    /// reservations whose lease ran out (their owner is gone).
    ///
    /// Reservations under a live lease are never touched.
    pub async fn sweep_expired(&self, conn: &mut SqliteConnection, now: DateTime<Utc>) -> Result<u64> {
        let swept = sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE (state = 'completed' AND expires_at <= ?1)
               OR (state = 'in_flight' AND reservation_expires_at <= ?1)
            "#,
        )
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if swept > 0 {
            self.metrics.idempotency_evicted.inc_by(swept);
            info!(swept, "Evicted expired idempotency records");
        }
        Ok(swept)
    }

    pub async fn stats(&self, conn: &mut SqliteConnection) -> Result<IdempotencyStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN state = 'in_flight' THEN 1 ELSE 0 END), 0) AS in_flight
            FROM idempotency_keys
            "#,
        )
        .fetch_one(&mut *conn)
        .await?;

        Ok(IdempotencyStats {
            completed: row.try_get::<i64, _>("completed")? as u64,
            in_flight: row.try_get::<i64, _>("in_flight")? as u64,
        })
    }
}

/// Drops the per-key [`Notify`] once its last waiter leaves, so keys owned
/// by other processes do not pile up.
struct WaiterGuard<'a> {
    waiters: &'a DashMap<String, Arc<Notify>>,
    key: &'a str,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters
            .remove_if(self.key, |_, notify| Arc::strong_count(notify) == 1);
    }
}

impl std::fmt::Debug for IdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("waiting_keys", &self.waiters.len())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}
