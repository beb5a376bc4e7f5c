//! Dead-letter queue access and replay
//!
//! DLQ rows are written once, by the worker, and never mutated. A replay
//! re-enqueues the entry's content as a brand-new outbox event through a
//! regular unit of work and records who asked for it in
//! `outbox_dlq_replays`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memoria_shared::{DlqEntryId, EventId, UnitOfWorkId};
use memoria_storage_core::clock::{from_millis, to_millis};
use memoria_storage_core::outbox::DlqReplay;
use memoria_storage_core::{
    DlqEntry, ParticipationContext, Result, StorageError, Store, StoreContribution,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::sync::Arc;
use tracing::info;

use crate::metrics::StorageMetrics;
use crate::pool::ConnectionPool;
use crate::sql::{decode_error, parse_id, parse_json};
use crate::unit_of_work::{BeginOptions, Begun, UnitOfWorkFactory};

const DLQ_COLUMNS: &str = "id, original_event_id, aggregate_id, aggregate_type, event_type, \
     payload, event_metadata, target_topic, partition_key, sequence_number, reason, \
     error_message, delivery_attempts, worker_id, original_created_at, moved_at";

/// Insert a DLQ entry on a connection that already holds the write lock.
pub(crate) async fn insert_dlq_entry(conn: &mut SqliteConnection, entry: &DlqEntry) -> Result<()> {
    sqlx::query(&format!(
        r#"
        INSERT INTO outbox_dlq ({})
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        "#,
        DLQ_COLUMNS
    ))
    .bind(entry.id.to_string())
    .bind(entry.original_event_id.to_string())
    .bind(&entry.aggregate_id)
    .bind(&entry.aggregate_type)
    .bind(&entry.event_type)
    .bind(serde_json::to_string(&entry.payload)?)
    .bind(
        entry
            .event_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
    )
    .bind(&entry.target_topic)
    .bind(&entry.partition_key)
    .bind(entry.sequence_number)
    .bind(entry.reason.as_str())
    .bind(&entry.error_message)
    .bind(i64::from(entry.delivery_attempts))
    .bind(entry.worker_id.as_deref())
    .bind(to_millis(entry.original_created_at))
    .bind(to_millis(entry.moved_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Read side of the DLQ plus replay.
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: ConnectionPool,
    metrics: StorageMetrics,
}

impl DeadLetterQueue {
    pub fn new(pool: ConnectionPool) -> Self {
        let metrics = pool.metrics().clone();
        Self { pool, metrics }
    }

    pub async fn get(&self, id: DlqEntryId) -> Result<Option<DlqEntry>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!("SELECT {} FROM outbox_dlq WHERE id = ?1", DLQ_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await;
        conn.release().await;
        row?.as_ref().map(entry_from_row).transpose()
    }

    /// Entries never replayed, oldest first.
    pub async fn list_unreplayed(&self, limit: u32) -> Result<Vec<DlqEntry>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM outbox_dlq
            WHERE NOT EXISTS (
                SELECT 1 FROM outbox_dlq_replays r WHERE r.dlq_entry_id = outbox_dlq.id
            )
            ORDER BY moved_at ASC
            LIMIT ?1
            "#,
            DLQ_COLUMNS
        ))
        .bind(i64::from(limit))
        .fetch_all(&mut *conn)
        .await;
        conn.release().await;
        rows?.iter().map(entry_from_row).collect()
    }

    /// Total entries. Also refreshes the depth gauge.
    pub async fn count(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let count: std::result::Result<i64, sqlx::Error> =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_dlq")
                .fetch_one(&mut *conn)
                .await;
        conn.release().await;

        let count = count?;
        self.metrics.dlq_depth.set(count);
        Ok(count as u64)
    }

    pub async fn replays(&self, id: DlqEntryId) -> Result<Vec<DlqReplay>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT dlq_entry_id, new_event_id, unit_of_work_id, requested_by, replayed_at
            FROM outbox_dlq_replays
            WHERE dlq_entry_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&mut *conn)
        .await;
        conn.release().await;

        rows?
            .iter()
            .map(|row| {
                let dlq_entry_id: String = row.try_get("dlq_entry_id")?;
                let new_event_id: String = row.try_get("new_event_id")?;
                let unit_of_work_id: String = row.try_get("unit_of_work_id")?;
                Ok(DlqReplay {
                    dlq_entry_id: parse_id("dlq_entry_id", &dlq_entry_id, DlqEntryId::from_string)?,
                    new_event_id: parse_id("new_event_id", &new_event_id, EventId::from_string)?,
                    unit_of_work_id: parse_id(
                        "unit_of_work_id",
                        &unit_of_work_id,
                        UnitOfWorkId::from_string,
                    )?,
                    requested_by: row.try_get("requested_by")?,
                    replayed_at: from_millis(row.try_get("replayed_at")?),
                })
            })
            .collect()
    }

    /// Re-enqueue an entry as a fresh outbox event with zero attempts.
    ///
    /// The new event is committed and receipted like any other write; the
    /// DLQ row itself is left untouched.
    pub async fn replay(
        &self,
        factory: &UnitOfWorkFactory,
        id: DlqEntryId,
        requested_by: &str,
    ) -> Result<DlqReplay> {
        let entry = self
            .get(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("dlq entry {}", id)))?;

        let begun = factory
            .begin(BeginOptions::new().with_operation("dlq_replay"))
            .await?;
        let Begun::Started(mut uow) = begun else {
            return Err(StorageError::store(REPLAY_AUDIT_STORE, "unexpected idempotent replay"));
        };

        let new_event_id = uow.enqueue_outbox(entry.to_replay_event())?;
        let replayed_at = Utc::now();
        uow.attach_store(Arc::new(ReplayAudit {
            dlq_entry_id: id,
            new_event_id,
            requested_by: requested_by.to_string(),
            replayed_at,
        }));
        uow.set_result(serde_json::json!({
            "dlq_entry_id": id.to_string(),
            "new_event_id": new_event_id.to_string(),
        }))?;
        let outcome = uow.commit().await?;

        info!(
            dlq_entry_id = %id,
            original_event_id = %entry.original_event_id,
            new_event_id = %new_event_id,
            requested_by,
            "Dead-lettered event replayed"
        );
        Ok(DlqReplay {
            dlq_entry_id: id,
            new_event_id,
            unit_of_work_id: outcome.unit_of_work_id,
            requested_by: requested_by.to_string(),
            replayed_at,
        })
    }
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue").finish_non_exhaustive()
    }
}

const REPLAY_AUDIT_STORE: &str = "outbox_dlq_replays";

/// Writes the replay audit row inside the replaying commit.
struct ReplayAudit {
    dlq_entry_id: DlqEntryId,
    new_event_id: EventId,
    requested_by: String,
    replayed_at: DateTime<Utc>,
}

#[async_trait]
impl Store for ReplayAudit {
    fn name(&self) -> &str {
        REPLAY_AUDIT_STORE
    }

    async fn participate(&self, ctx: &mut ParticipationContext<'_>) -> Result<StoreContribution> {
        let unit_of_work_id = ctx.unit_of_work_id();
        sqlx::query(
            r#"
            INSERT INTO outbox_dlq_replays
                (dlq_entry_id, new_event_id, unit_of_work_id, requested_by, replayed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(self.dlq_entry_id.to_string())
        .bind(self.new_event_id.to_string())
        .bind(unit_of_work_id.to_string())
        .bind(&self.requested_by)
        .bind(to_millis(self.replayed_at))
        .execute(ctx.connection())
        .await?;

        Ok(StoreContribution::new(REPLAY_AUDIT_STORE, 1))
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<DlqEntry> {
    let id: String = row.try_get("id")?;
    let original_event_id: String = row.try_get("original_event_id")?;
    let payload: String = row.try_get("payload")?;
    let reason: String = row.try_get("reason")?;
    let attempts: i64 = row.try_get("delivery_attempts")?;

    Ok(DlqEntry {
        id: parse_id("id", &id, DlqEntryId::from_string)?,
        original_event_id: parse_id(
            "original_event_id",
            &original_event_id,
            EventId::from_string,
        )?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        event_type: row.try_get("event_type")?,
        payload: parse_json("payload", &payload)?,
        event_metadata: row
            .try_get::<Option<String>, _>("event_metadata")?
            .map(|m| parse_json("event_metadata", &m))
            .transpose()?,
        target_topic: row.try_get("target_topic")?,
        partition_key: row.try_get("partition_key")?,
        sequence_number: row.try_get("sequence_number")?,
        reason: reason.parse().map_err(|_| decode_error("reason", &reason))?,
        error_message: row.try_get("error_message")?,
        delivery_attempts: u32::try_from(attempts)
            .map_err(|_| decode_error("delivery_attempts", &attempts.to_string()))?,
        worker_id: row.try_get("worker_id")?,
        original_created_at: from_millis(row.try_get("original_created_at")?),
        moved_at: from_millis(row.try_get("moved_at")?),
    })
}
