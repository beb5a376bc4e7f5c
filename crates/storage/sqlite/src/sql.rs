//! Transaction statements and row decoding shared by the adapters.
//!
//! Transactions are driven with explicit statements on a leased
//! connection so the connection can be carried across await points by the
//! unit of work without borrowing it into a `sqlx::Transaction`.

use memoria_storage_core::{Result, StorageError};
use sqlx::SqliteConnection;
use tracing::warn;

/// Deferred: the write lock is taken by the first write statement.
pub(crate) async fn begin(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("BEGIN").execute(conn).await?;
    Ok(())
}

/// Takes the write lock up front (waits up to the busy timeout).
pub(crate) async fn begin_immediate(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("BEGIN IMMEDIATE").execute(conn).await?;
    Ok(())
}

pub(crate) async fn commit(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("COMMIT").execute(conn).await?;
    Ok(())
}

/// Roll back; a failure is logged and returned.
pub(crate) async fn rollback(conn: &mut SqliteConnection) -> Result<()> {
    if let Err(e) = sqlx::query("ROLLBACK").execute(conn).await {
        warn!(error = %e, "Rollback failed");
        return Err(e.into());
    }
    Ok(())
}

pub(crate) fn decode_error(column: &str, value: &str) -> StorageError {
    StorageError::Database(sqlx::Error::Decode(
        format!("invalid value '{}' in column {}", value, column).into(),
    ))
}

/// Parse an identifier stored as TEXT.
pub(crate) fn parse_id<T>(column: &str, value: &str, parse: fn(&str) -> Option<T>) -> Result<T> {
    parse(value).ok_or_else(|| decode_error(column, value))
}

pub(crate) fn parse_json(column: &str, value: &str) -> Result<serde_json::Value> {
    serde_json::from_str(value).map_err(|_| decode_error(column, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoria_shared::EventId;

    #[test]
    fn test_parse_id_reports_column() {
        let err = parse_id("id", "not-a-uuid", EventId::from_string).unwrap_err();
        assert!(err.to_string().contains("column id"));

        let id = EventId::new();
        assert_eq!(
            parse_id("id", &id.to_string(), EventId::from_string).unwrap(),
            id
        );
    }
}
