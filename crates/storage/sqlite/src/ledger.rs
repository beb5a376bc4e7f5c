//! Write-receipt ledger backed by `write_receipts`.

use chrono::{DateTime, Utc};
use memoria_shared::{ReceiptId, UnitOfWorkId};
use memoria_storage_core::clock::{from_millis, to_millis};
use memoria_storage_core::ledger::{compute_chain_hash, verify_entries, ChainEntry, UndecodableReceipt};
use memoria_storage_core::{
    ChainAnchor, Hash256, IntegrityReport, ReceiptSigner, Result, WriteReceipt, GENESIS_CHAIN_HASH,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::metrics::StorageMetrics;
use crate::pool::ConnectionPool;
use crate::sql::{decode_error, parse_id};

const RECEIPT_COLUMNS: &str = "id, sequence, unit_of_work_id, stores_affected, payload_hash, \
     prev_receipt_hash, chain_hash, signature, timestamp";

pub struct ReceiptLedger {
    pool: ConnectionPool,
    signer: Arc<dyn ReceiptSigner>,
    metrics: StorageMetrics,
}

impl ReceiptLedger {
    pub fn new(pool: ConnectionPool, signer: Arc<dyn ReceiptSigner>) -> Self {
        let metrics = pool.metrics().clone();
        Self {
            pool,
            signer,
            metrics,
        }
    }

    pub fn signer(&self) -> &Arc<dyn ReceiptSigner> {
        &self.signer
    }

    /// Append a receipt chained to the latest one.
    ///
    /// Must run inside the committing transaction, after its write lock is
    /// held, so the predecessor read here is still the predecessor at commit.
    pub async fn append_in_tx(
        &self,
        conn: &mut SqliteConnection,
        unit_of_work_id: UnitOfWorkId,
        stores_affected: Vec<String>,
        payload_hash: Hash256,
    ) -> Result<WriteReceipt> {
        let anchor = latest_anchor(conn).await?;
        let chain_hash = compute_chain_hash(&payload_hash, &anchor.chain_hash);

        let receipt = WriteReceipt {
            id: ReceiptId::new(),
            sequence: anchor.sequence + 1,
            unit_of_work_id,
            stores_affected,
            payload_hash,
            prev_receipt_hash: anchor.chain_hash,
            signature: self.signer.sign(&chain_hash),
            chain_hash,
            timestamp: from_millis(to_millis(Utc::now())),
        };

        sqlx::query(
            r#"
            INSERT INTO write_receipts
                (id, sequence, unit_of_work_id, stores_affected, payload_hash,
                 prev_receipt_hash, chain_hash, signature, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(receipt.id.to_string())
        .bind(receipt.sequence)
        .bind(receipt.unit_of_work_id.to_string())
        .bind(serde_json::to_string(&receipt.stores_affected)?)
        .bind(receipt.payload_hash.to_hex())
        .bind(receipt.prev_receipt_hash.to_hex())
        .bind(receipt.chain_hash.to_hex())
        .bind(&receipt.signature)
        .bind(to_millis(receipt.timestamp))
        .execute(&mut *conn)
        .await?;

        self.metrics.receipts_appended.inc();
        debug!(
            receipt_id = %receipt.id,
            sequence = receipt.sequence,
            unit_of_work_id = %unit_of_work_id,
            "Receipt appended"
        );
        Ok(receipt)
    }

    pub async fn latest(&self) -> Result<Option<WriteReceipt>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM write_receipts ORDER BY sequence DESC LIMIT 1",
            RECEIPT_COLUMNS
        ))
        .fetch_optional(&mut *conn)
        .await;
        conn.release().await;
        row?.as_ref().map(receipt_from_row).transpose()
    }

    pub async fn get(&self, id: ReceiptId) -> Result<Option<WriteReceipt>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM write_receipts WHERE id = ?1",
            RECEIPT_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await;
        conn.release().await;
        row?.as_ref().map(receipt_from_row).transpose()
    }

    pub async fn find_by_unit_of_work(
        &self,
        unit_of_work_id: UnitOfWorkId,
    ) -> Result<Option<WriteReceipt>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM write_receipts WHERE unit_of_work_id = ?1",
            RECEIPT_COLUMNS
        ))
        .bind(unit_of_work_id.to_string())
        .fetch_optional(&mut *conn)
        .await;
        conn.release().await;
        row?.as_ref().map(receipt_from_row).transpose()
    }

    /// Recompute the chain over receipts timestamped within `[from, to]`.
    ///
    /// The window is anchored on the nearest receipt before it (or genesis),
    /// so a deletion right before the window is reported as missing too.
    pub async fn verify_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<IntegrityReport> {
        let mut conn = self.pool.acquire().await?;
        let loaded = load_window(&mut conn, from, to).await;
        conn.release().await;
        let window = loaded?;

        for entry in window.entries.iter().filter_map(|e| e.as_ref().err()) {
            warn!(sequence = entry.sequence, reason = %entry.reason, "Undecodable receipt");
        }
        let report = verify_entries(
            window.anchor_sequence,
            window.anchor_hash,
            window.entries.iter().map(|entry| match entry {
                Ok(receipt) => ChainEntry::Decoded(receipt),
                Err(undecodable) => ChainEntry::Undecodable(undecodable),
            }),
            self.signer.as_ref(),
        );
        if let Some(link) = &report.first_broken {
            error!(
                sequence = link.sequence,
                kind = %link.kind,
                corrupted = report.corrupted,
                missing = report.missing,
                "Receipt chain broken"
            );
        } else {
            info!(verified = report.verified, "Receipt chain verified");
        }
        Ok(report)
    }

    /// Verify the whole ledger.
    pub async fn verify_all(&self) -> Result<IntegrityReport> {
        self.verify_range(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
            .await
    }
}

impl std::fmt::Debug for ReceiptLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptLedger")
            .field("key_id", &self.signer.key_id())
            .finish()
    }
}

async fn latest_anchor(conn: &mut SqliteConnection) -> Result<ChainAnchor> {
    let row = sqlx::query("SELECT sequence, chain_hash FROM write_receipts ORDER BY sequence DESC LIMIT 1")
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => Ok(ChainAnchor {
            sequence: row.try_get("sequence")?,
            chain_hash: Hash256::from_hex(&row.try_get::<String, _>("chain_hash")?)?,
        }),
        None => Ok(ChainAnchor::genesis()),
    }
}

/// Receipts of a verification window plus the chain position before it.
struct Window {
    anchor_sequence: i64,
    /// `None` when the preceding receipt's chain hash is unreadable
    anchor_hash: Option<Hash256>,
    entries: Vec<std::result::Result<WriteReceipt, UndecodableReceipt>>,
}

async fn load_window(
    conn: &mut SqliteConnection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Window> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM write_receipts WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY sequence ASC",
        RECEIPT_COLUMNS
    ))
    .bind(to_millis(from))
    .bind(to_millis(to))
    .fetch_all(&mut *conn)
    .await?;

    let entries = rows
        .iter()
        .map(stored_receipt_from_row)
        .collect::<Result<Vec<_>>>()?;

    let first_sequence = match entries.first() {
        Some(Ok(receipt)) => receipt.sequence,
        Some(Err(undecodable)) => undecodable.sequence,
        None => {
            return Ok(Window {
                anchor_sequence: 0,
                anchor_hash: Some(GENESIS_CHAIN_HASH),
                entries,
            })
        }
    };

    let anchor_row = sqlx::query(
        "SELECT sequence, chain_hash FROM write_receipts WHERE sequence < ?1 ORDER BY sequence DESC LIMIT 1",
    )
    .bind(first_sequence)
    .fetch_optional(&mut *conn)
    .await?;

    let (anchor_sequence, anchor_hash) = match anchor_row {
        Some(row) => (
            row.try_get("sequence")?,
            Hash256::from_hex(&row.try_get::<String, _>("chain_hash")?).ok(),
        ),
        None => (0, Some(GENESIS_CHAIN_HASH)),
    };
    Ok(Window {
        anchor_sequence,
        anchor_hash,
        entries,
    })
}

/// Decode a receipt row, keeping rows with tampered hash columns as
/// [`UndecodableReceipt`]. Only a row without a readable sequence fails.
fn stored_receipt_from_row(
    row: &SqliteRow,
) -> Result<std::result::Result<WriteReceipt, UndecodableReceipt>> {
    let sequence: i64 = row.try_get("sequence")?;
    Ok(receipt_from_row(row).map_err(|e| UndecodableReceipt {
        sequence,
        receipt_id: row
            .try_get::<String, _>("id")
            .ok()
            .and_then(|id| ReceiptId::from_string(&id)),
        reason: e.to_string(),
    }))
}

fn receipt_from_row(row: &SqliteRow) -> Result<WriteReceipt> {
    let id: String = row.try_get("id")?;
    let unit_of_work_id: String = row.try_get("unit_of_work_id")?;
    let stores_affected: String = row.try_get("stores_affected")?;

    Ok(WriteReceipt {
        id: parse_id("id", &id, ReceiptId::from_string)?,
        sequence: row.try_get("sequence")?,
        unit_of_work_id: parse_id("unit_of_work_id", &unit_of_work_id, UnitOfWorkId::from_string)?,
        stores_affected: serde_json::from_str(&stores_affected)
            .map_err(|_| decode_error("stores_affected", &stores_affected))?,
        payload_hash: Hash256::from_hex(&row.try_get::<String, _>("payload_hash")?)?,
        prev_receipt_hash: Hash256::from_hex(&row.try_get::<String, _>("prev_receipt_hash")?)?,
        chain_hash: Hash256::from_hex(&row.try_get::<String, _>("chain_hash")?)?,
        signature: row.try_get("signature")?,
        timestamp: from_millis(row.try_get("timestamp")?),
    })
}
