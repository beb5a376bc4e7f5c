//! Outbox table access
//!
//! Inserts happen only through [`OutboxStore::insert_in_tx`] on the
//! connection of a committing unit of work. Every other mutation belongs to
//! the worker and is guarded by `delivery_status = 'processing' AND
//! lease_owner = ?`, so a worker whose lease was taken over cannot clobber
//! the new holder.

use chrono::{DateTime, Utc};
use memoria_shared::{EventId, UnitOfWorkId};
use memoria_storage_core::clock::{duration_millis, from_millis, to_millis};
use memoria_storage_core::outbox::Jitter;
use memoria_storage_core::outbox::OutboxStats;
use memoria_storage_core::{
    DeliveryStatus, DlqEntry, DlqReason, NewOutboxEvent, OutboxEvent, Result, RetryPolicy,
    StorageError,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::metrics::StorageMetrics;
use crate::pool::ConnectionPool;
use crate::sql::{self, decode_error, parse_id, parse_json};

use super::dlq::insert_dlq_entry;

pub(crate) const EVENT_COLUMNS: &str = "id, unit_of_work_id, aggregate_id, aggregate_type, \
     event_type, payload, event_metadata, sequence_number, created_at, delivery_attempts, \
     delivery_status, first_attempt_at, last_attempt_at, next_retry_at, delivered_at, \
     target_topic, partition_key, max_attempts, base_delay_ms, max_delay_ms, \
     backoff_multiplier, last_error, lease_owner, lease_expires_at";

/// Result of recording a failed delivery
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    /// Scheduled for another attempt.
    Retrying {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Attempts exhausted; the event is now in the DLQ.
    DeadLettered(DlqEntry),
    /// The lease expired and another worker owns the event now.
    LeaseLost,
}

#[derive(Clone)]
pub struct OutboxStore {
    pool: ConnectionPool,
    metrics: StorageMetrics,
}

impl OutboxStore {
    pub fn new(pool: ConnectionPool) -> Self {
        let metrics = pool.metrics().clone();
        Self { pool, metrics }
    }

    /// Insert a staged event on a committing connection.
    ///
    /// The sequence number is one past the highest of the aggregate; under
    /// the commit's write lock no other writer can interleave.
    pub async fn insert_in_tx(
        conn: &mut SqliteConnection,
        unit_of_work_id: UnitOfWorkId,
        event_id: EventId,
        event: &NewOutboxEvent,
        default_policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<OutboxEvent> {
        let policy = event.retry_policy.clone().unwrap_or_else(|| default_policy.clone());
        policy.validate()?;
        let metadata = stamp_metadata(event.metadata.clone(), unit_of_work_id);
        let target_topic = event.resolved_topic();
        let partition_key = event.resolved_partition_key();
        let now_ms = to_millis(now);

        let row = sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, unit_of_work_id, aggregate_id, aggregate_type, event_type, payload,
                 event_metadata, sequence_number, created_at, delivery_attempts,
                 delivery_status, next_retry_at, target_topic, partition_key,
                 max_attempts, base_delay_ms, max_delay_ms, backoff_multiplier)
            VALUES
                (?1, ?2, ?3, ?4, ?5, ?6, ?7,
                 (SELECT COALESCE(MAX(sequence_number), 0) + 1
                    FROM outbox_events WHERE aggregate_id = ?3),
                 ?8, 0, 'pending', ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            RETURNING sequence_number
            "#,
        )
        .bind(event_id.to_string())
        .bind(unit_of_work_id.to_string())
        .bind(&event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(&event.event_type)
        .bind(serde_json::to_string(&event.payload)?)
        .bind(serde_json::to_string(&metadata)?)
        .bind(now_ms)
        .bind(&target_topic)
        .bind(&partition_key)
        .bind(i64::from(policy.max_attempts))
        .bind(policy.base_delay_ms as i64)
        .bind(policy.max_delay_ms as i64)
        .bind(policy.backoff_multiplier)
        .fetch_one(&mut *conn)
        .await?;

        let sequence_number: i64 = row.try_get("sequence_number")?;
        debug!(
            event_id = %event_id,
            aggregate_id = %event.aggregate_id,
            sequence_number,
            "Outbox event staged in commit"
        );

        Ok(OutboxEvent {
            id: event_id,
            unit_of_work_id: Some(unit_of_work_id),
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            event_metadata: Some(metadata),
            sequence_number,
            created_at: from_millis(now_ms),
            delivery_attempts: 0,
            delivery_status: DeliveryStatus::Pending,
            first_attempt_at: None,
            last_attempt_at: None,
            next_retry_at: from_millis(now_ms),
            delivered_at: None,
            target_topic,
            partition_key,
            retry_policy: policy,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
        })
    }

    /// Lease up to `batch_size` ready events for `worker_id`.
    ///
    /// Per aggregate, only the consecutive run of ready events at the head
    /// of its open sequence is leased; an event that is processing under a
    /// live lease, or not yet due, blocks everything after it. The claim runs
    /// under `BEGIN IMMEDIATE`, so two workers never lease the same event.
    pub async fn claim_batch(
        &self,
        worker_id: &str,
        batch_size: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.pool.acquire().await?;
        if let Err(e) = sql::begin_immediate(&mut conn).await {
            conn.release().await;
            return Err(e);
        }

        let claimed = claim_in_tx(&mut conn, worker_id, batch_size, lease).await;
        let outcome = match claimed {
            Ok(events) => sql::commit(&mut conn).await.map(|_| events),
            Err(e) => {
                let _ = sql::rollback(&mut conn).await;
                Err(e)
            }
        };

        if outcome.as_ref().is_err_and(|e| e.is_connection_fault()) {
            conn.mark_broken();
        }
        conn.release().await;

        let events = outcome?;
        if !events.is_empty() {
            debug!(worker_id, leased = events.len(), "Leased outbox events");
        }
        Ok(events)
    }

    /// Mark a leased event delivered. Returns false when the lease was lost.
    pub async fn mark_delivered(&self, event_id: EventId, worker_id: &str) -> Result<bool> {
        let now_ms = to_millis(Utc::now());
        let mut conn = self.pool.acquire().await?;
        let updated = sqlx::query(
            r#"
            UPDATE outbox_events
            SET delivery_status = 'delivered',
                delivery_attempts = delivery_attempts + 1,
                first_attempt_at = COALESCE(first_attempt_at, ?1),
                delivered_at = ?1,
                last_attempt_at = ?1,
                last_error = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = ?2 AND delivery_status = 'processing' AND lease_owner = ?3
            "#,
        )
        .bind(now_ms)
        .bind(event_id.to_string())
        .bind(worker_id)
        .execute(&mut *conn)
        .await;
        conn.release().await;

        let delivered = updated?.rows_affected() == 1;
        if delivered {
            self.metrics.record_outbox("delivered");
        } else {
            warn!(event_id = %event_id, worker_id, "Lease lost before marking delivered");
        }
        Ok(delivered)
    }

    /// Count a failed attempt and either schedule a retry or, once the
    /// policy is exhausted, dead-letter the event with `exhausted_reason`.
    pub async fn record_failure(
        &self,
        event: &OutboxEvent,
        worker_id: &str,
        error: &str,
        jitter: Jitter,
        exhausted_reason: DlqReason,
    ) -> Result<FailureOutcome> {
        let attempt = event.delivery_attempts + 1;
        if !event.retry_policy.can_retry(attempt) {
            return Ok(
                match self
                    .move_to_dlq(event, attempt, exhausted_reason, error, worker_id)
                    .await?
                {
                    Some(entry) => FailureOutcome::DeadLettered(entry),
                    None => FailureOutcome::LeaseLost,
                },
            );
        }

        let now = Utc::now();
        let next_retry_at = event.retry_policy.next_retry_at(attempt, jitter, now);
        let mut conn = self.pool.acquire().await?;
        let updated = sqlx::query(
            r#"
            UPDATE outbox_events
            SET delivery_status = 'failed',
                delivery_attempts = ?1,
                first_attempt_at = COALESCE(first_attempt_at, ?2),
                last_attempt_at = ?2,
                next_retry_at = ?3,
                last_error = ?4,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = ?5 AND delivery_status = 'processing' AND lease_owner = ?6
            "#,
        )
        .bind(i64::from(attempt))
        .bind(to_millis(now))
        .bind(to_millis(next_retry_at))
        .bind(error)
        .bind(event.id.to_string())
        .bind(worker_id)
        .execute(&mut *conn)
        .await;
        conn.release().await;

        if updated?.rows_affected() != 1 {
            warn!(event_id = %event.id, worker_id, "Lease lost before recording failure");
            return Ok(FailureOutcome::LeaseLost);
        }

        self.metrics.record_outbox("retried");
        warn!(
            event_id = %event.id,
            aggregate_id = %event.aggregate_id,
            attempt,
            max_attempts = event.retry_policy.max_attempts,
            next_retry_at = %next_retry_at,
            error,
            "Outbox delivery failed, retry scheduled"
        );
        Ok(FailureOutcome::Retrying {
            attempt,
            next_retry_at,
        })
    }

    /// Move a leased event to the DLQ, counting `attempts` delivery attempts.
    ///
    /// The status change and the DLQ insert commit together. Returns `None`
    /// when the lease was lost.
    pub async fn move_to_dlq(
        &self,
        event: &OutboxEvent,
        attempts: u32,
        reason: DlqReason,
        error: &str,
        worker_id: &str,
    ) -> Result<Option<DlqEntry>> {
        let now = Utc::now();
        let mut conn = self.pool.acquire().await?;
        if let Err(e) = sql::begin_immediate(&mut conn).await {
            conn.release().await;
            return Err(e);
        }

        let moved = async {
            let updated = sqlx::query(
                r#"
                UPDATE outbox_events
                SET delivery_status = 'dlq',
                    delivery_attempts = ?1,
                    first_attempt_at = COALESCE(first_attempt_at, ?2),
                    last_attempt_at = ?2,
                    last_error = ?3,
                    lease_owner = NULL,
                    lease_expires_at = NULL
                WHERE id = ?4 AND delivery_status = 'processing' AND lease_owner = ?5
                "#,
            )
            .bind(i64::from(attempts))
            .bind(to_millis(now))
            .bind(error)
            .bind(event.id.to_string())
            .bind(worker_id)
            .execute(&mut *conn)
            .await?;

            if updated.rows_affected() != 1 {
                return Ok::<_, StorageError>(None);
            }

            let mut snapshot = event.clone();
            snapshot.delivery_attempts = attempts;
            let entry = DlqEntry::from_outbox_event(
                &snapshot,
                reason,
                error,
                Some(worker_id.to_string()),
                now,
            );
            insert_dlq_entry(&mut conn, &entry).await?;
            Ok::<_, StorageError>(Some(entry))
        }
        .await;

        let outcome = match moved {
            Ok(entry) => sql::commit(&mut conn).await.map(|_| entry),
            Err(e) => {
                let _ = sql::rollback(&mut conn).await;
                Err(e)
            }
        };
        conn.release().await;

        let entry = outcome?;
        match &entry {
            Some(entry) => self.metrics.record_dead_letter(entry.reason.as_str()),
            None => warn!(event_id = %event.id, worker_id, "Lease lost before dead-lettering"),
        }
        Ok(entry)
    }

    /// Hand leased events back without counting an attempt.
    pub async fn release_leases(&self, event_ids: &[EventId], worker_id: &str) -> Result<u64> {
        if event_ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.acquire().await?;
        let mut released = 0;
        let mut failure = None;
        for event_id in event_ids {
            let updated = sqlx::query(
                r#"
                UPDATE outbox_events
                SET delivery_status = CASE WHEN delivery_attempts = 0 THEN 'pending' ELSE 'failed' END,
                    lease_owner = NULL,
                    lease_expires_at = NULL
                WHERE id = ?1 AND delivery_status = 'processing' AND lease_owner = ?2
                "#,
            )
            .bind(event_id.to_string())
            .bind(worker_id)
            .execute(&mut *conn)
            .await;

            match updated {
                Ok(result) => released += result.rows_affected(),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        conn.release().await;

        if let Some(e) = failure {
            return Err(e.into());
        }
        if released > 0 {
            self.metrics
                .outbox_events
                .with_label_values(&["released"])
                .inc_by(released);
            debug!(worker_id, released, "Released outbox leases");
        }
        Ok(released)
    }

    pub async fn get(&self, event_id: EventId) -> Result<Option<OutboxEvent>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM outbox_events WHERE id = ?1",
            EVENT_COLUMNS
        ))
        .bind(event_id.to_string())
        .fetch_optional(&mut *conn)
        .await;
        conn.release().await;
        row?.as_ref().map(event_from_row).transpose()
    }

    /// All events of an aggregate in sequence order, terminal ones included.
    pub async fn list_by_aggregate(&self, aggregate_id: &str) -> Result<Vec<OutboxEvent>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM outbox_events WHERE aggregate_id = ?1 ORDER BY sequence_number ASC",
            EVENT_COLUMNS
        ))
        .bind(aggregate_id)
        .fetch_all(&mut *conn)
        .await;
        conn.release().await;
        rows?.iter().map(event_from_row).collect()
    }

    pub async fn stats(&self) -> Result<OutboxStats> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT delivery_status, COUNT(*) AS total FROM outbox_events GROUP BY delivery_status",
        )
        .fetch_all(&mut *conn)
        .await;
        conn.release().await;

        let mut stats = OutboxStats::default();
        for row in rows? {
            let status: String = row.try_get("delivery_status")?;
            let total = row.try_get::<i64, _>("total")? as u64;
            match status.parse::<DeliveryStatus>() {
                Ok(DeliveryStatus::Pending) => stats.pending = total,
                Ok(DeliveryStatus::Processing) => stats.processing = total,
                Ok(DeliveryStatus::Delivered) => stats.delivered = total,
                Ok(DeliveryStatus::Failed) => stats.failed = total,
                Ok(DeliveryStatus::Dlq) => stats.dlq = total,
                Err(_) => return Err(decode_error("delivery_status", &status)),
            }
        }
        Ok(stats)
    }

    /// Delete events delivered before `older_than`.
    ///
    /// The highest sequence of each aggregate is kept so numbering never
    /// restarts.
    pub async fn purge_delivered(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let purged = sqlx::query(
            r#"
            DELETE FROM outbox_events
            WHERE delivery_status = 'delivered'
              AND delivered_at < ?1
              AND sequence_number < (
                  SELECT MAX(newer.sequence_number)
                  FROM outbox_events AS newer
                  WHERE newer.aggregate_id = outbox_events.aggregate_id
              )
            "#,
        )
        .bind(to_millis(older_than))
        .execute(&mut *conn)
        .await;
        conn.release().await;

        let purged = purged?.rows_affected();
        if purged > 0 {
            info!(purged, older_than = %older_than, "Purged delivered outbox events");
        }
        Ok(purged)
    }
}

/// Aggregates whose oldest open event can be leased now, oldest first.
async fn ready_aggregates(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        WITH heads AS (
            SELECT aggregate_id, MIN(sequence_number) AS head_sequence
            FROM outbox_events
            WHERE delivery_status IN ('pending', 'processing', 'failed')
            GROUP BY aggregate_id
        )
        SELECT head.aggregate_id
        FROM outbox_events AS head
        JOIN heads
          ON head.aggregate_id = heads.aggregate_id
         AND head.sequence_number = heads.head_sequence
        WHERE (head.delivery_status IN ('pending', 'failed') AND head.next_retry_at <= ?1)
           OR (head.delivery_status = 'processing'
               AND (head.lease_expires_at IS NULL OR head.lease_expires_at <= ?1))
        ORDER BY head.created_at ASC, head.aggregate_id ASC
        LIMIT ?2
        "#,
    )
    .bind(to_millis(now))
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

async fn claim_in_tx(
    conn: &mut SqliteConnection,
    worker_id: &str,
    batch_size: u32,
    lease: Duration,
) -> Result<Vec<OutboxEvent>> {
    let now = Utc::now();
    let aggregates = ready_aggregates(conn, now, batch_size).await?;

    let mut selected = Vec::new();
    for aggregate_id in aggregates {
        let remaining = batch_size as usize - selected.len();
        if remaining == 0 {
            break;
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM outbox_events
            WHERE aggregate_id = ?1
              AND delivery_status IN ('pending', 'processing', 'failed')
            ORDER BY sequence_number ASC, created_at ASC
            LIMIT ?2
            "#,
            EVENT_COLUMNS
        ))
        .bind(&aggregate_id)
        .bind(remaining as i64)
        .fetch_all(&mut *conn)
        .await?;

        let open = rows.iter().map(event_from_row).collect::<Result<Vec<_>>>()?;
        selected.extend(select_leasable(open, now, remaining));
    }

    let lease_expires_at = now + chrono::Duration::milliseconds(duration_millis(lease));
    for event in &mut selected {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET delivery_status = 'processing',
                lease_owner = ?1,
                lease_expires_at = ?2
            WHERE id = ?3 AND delivery_status IN ('pending', 'processing', 'failed')
            "#,
        )
        .bind(worker_id)
        .bind(to_millis(lease_expires_at))
        .bind(event.id.to_string())
        .execute(&mut *conn)
        .await?;

        event.delivery_status = DeliveryStatus::Processing;
        event.lease_owner = Some(worker_id.to_string());
        event.lease_expires_at = Some(from_millis(to_millis(lease_expires_at)));
    }

    Ok(selected)
}

/// Pick the leasable head run of each aggregate from open events sorted by
/// `(aggregate_id, sequence_number, created_at)`.
pub(crate) fn select_leasable(
    open: Vec<OutboxEvent>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<OutboxEvent> {
    let mut blocked: HashSet<String> = HashSet::new();
    let mut selected = Vec::new();

    for event in open {
        if selected.len() >= limit {
            break;
        }
        if blocked.contains(&event.aggregate_id) {
            continue;
        }
        if event.is_leasable(now) {
            selected.push(event);
        } else {
            blocked.insert(event.aggregate_id);
        }
    }
    selected
}

fn stamp_metadata(
    metadata: Option<serde_json::Value>,
    unit_of_work_id: UnitOfWorkId,
) -> serde_json::Value {
    let mut map = match metadata {
        Some(serde_json::Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    let uow = serde_json::Value::String(unit_of_work_id.to_string());
    map.entry("correlation_id").or_insert_with(|| uow.clone());
    map.insert("unit_of_work_id".to_string(), uow);
    serde_json::Value::Object(map)
}

pub(crate) fn event_from_row(row: &SqliteRow) -> Result<OutboxEvent> {
    let id: String = row.try_get("id")?;
    let unit_of_work_id: Option<String> = row.try_get("unit_of_work_id")?;
    let payload: String = row.try_get("payload")?;
    let metadata: Option<String> = row.try_get("event_metadata")?;
    let status: String = row.try_get("delivery_status")?;
    let optional_time = |column: &str| -> Result<Option<DateTime<Utc>>> {
        Ok(row.try_get::<Option<i64>, _>(column)?.map(from_millis))
    };

    Ok(OutboxEvent {
        id: parse_id("id", &id, EventId::from_string)?,
        unit_of_work_id: unit_of_work_id
            .map(|v| parse_id("unit_of_work_id", &v, UnitOfWorkId::from_string))
            .transpose()?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        event_type: row.try_get("event_type")?,
        payload: parse_json("payload", &payload)?,
        event_metadata: metadata
            .map(|m| parse_json("event_metadata", &m))
            .transpose()?,
        sequence_number: row.try_get("sequence_number")?,
        created_at: from_millis(row.try_get("created_at")?),
        delivery_attempts: row.try_get::<i64, _>("delivery_attempts")?.max(0) as u32,
        delivery_status: status
            .parse()
            .map_err(|_| decode_error("delivery_status", &status))?,
        first_attempt_at: optional_time("first_attempt_at")?,
        last_attempt_at: optional_time("last_attempt_at")?,
        next_retry_at: from_millis(row.try_get("next_retry_at")?),
        delivered_at: optional_time("delivered_at")?,
        target_topic: row.try_get("target_topic")?,
        partition_key: row.try_get("partition_key")?,
        retry_policy: RetryPolicy::new(
            row.try_get::<i64, _>("max_attempts")?.max(0) as u32,
            row.try_get::<i64, _>("base_delay_ms")?.max(0) as u64,
            row.try_get::<i64, _>("max_delay_ms")?.max(0) as u64,
            row.try_get("backoff_multiplier")?,
        ),
        last_error: row.try_get("last_error")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: optional_time("lease_expires_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_event(aggregate_id: &str, sequence_number: i64, status: DeliveryStatus) -> OutboxEvent {
        let now = Utc::now();
        OutboxEvent {
            id: EventId::new(),
            unit_of_work_id: None,
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: "Memory".to_string(),
            event_type: "MEMORY_CREATED".to_string(),
            payload: json!({"n": sequence_number}),
            event_metadata: None,
            sequence_number,
            created_at: now,
            delivery_attempts: 0,
            delivery_status: status,
            first_attempt_at: None,
            last_attempt_at: None,
            next_retry_at: now - chrono::Duration::seconds(1),
            delivered_at: None,
            target_topic: "memoria.memory".to_string(),
            partition_key: aggregate_id.to_string(),
            retry_policy: RetryPolicy::default(),
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
        }
    }

    #[test]
    fn test_select_takes_head_run_per_aggregate() {
        let now = Utc::now();
        let mut leased = open_event("a", 2, DeliveryStatus::Processing);
        leased.lease_owner = Some("worker-1".into());
        leased.lease_expires_at = Some(now + chrono::Duration::seconds(30));

        let open = vec![
            open_event("a", 1, DeliveryStatus::Pending),
            leased,
            open_event("a", 3, DeliveryStatus::Pending),
            open_event("b", 1, DeliveryStatus::Pending),
            open_event("b", 2, DeliveryStatus::Pending),
        ];

        let picked: Vec<(String, i64)> = select_leasable(open, now, 10)
            .into_iter()
            .map(|e| (e.aggregate_id, e.sequence_number))
            .collect();

        assert_eq!(
            picked,
            vec![("a".into(), 1), ("b".into(), 1), ("b".into(), 2)]
        );
    }

    #[test]
    fn test_not_yet_due_retry_blocks_successors() {
        let now = Utc::now();
        let mut waiting = open_event("a", 1, DeliveryStatus::Failed);
        waiting.next_retry_at = now + chrono::Duration::seconds(5);

        let open = vec![waiting, open_event("a", 2, DeliveryStatus::Pending)];
        assert!(select_leasable(open, now, 10).is_empty());
    }

    #[test]
    fn test_expired_lease_is_reclaimable() {
        let now = Utc::now();
        let mut stale = open_event("a", 1, DeliveryStatus::Processing);
        stale.lease_owner = Some("crashed".into());
        stale.lease_expires_at = Some(now - chrono::Duration::seconds(1));

        let picked = select_leasable(vec![stale], now, 10);
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn test_limit_is_respected() {
        let now = Utc::now();
        let open = (1..=5)
            .map(|seq| open_event("a", seq, DeliveryStatus::Pending))
            .collect();
        assert_eq!(select_leasable(open, now, 2).len(), 2);
    }

    #[test]
    fn test_stamp_metadata_keeps_caller_correlation() {
        let uow = UnitOfWorkId::new();
        let stamped = stamp_metadata(Some(json!({"correlation_id": "req-1"})), uow);
        assert_eq!(stamped["correlation_id"], "req-1");
        assert_eq!(stamped["unit_of_work_id"], uow.to_string());

        let defaulted = stamp_metadata(None, uow);
        assert_eq!(defaulted["correlation_id"], uow.to_string());
    }
}
