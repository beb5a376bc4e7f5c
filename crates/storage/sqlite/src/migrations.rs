//! Versioned schema migrations
//!
//! [`MigrationRunner::run_pending`] applies every migration newer than the
//! recorded history, one transaction per migration, under a cross-process
//! advisory lock. Recorded checksums are re-verified on every run; drift is
//! fatal and no [`SchemaReady`] token is produced, so no unit of work or
//! outbox worker can be constructed.
//!
//! # Usage
//!
//! ```ignore
//! let migrations = schema::core_migration_set()?.extend(app_migrations)?;
//! let runner = MigrationRunner::new(pool.clone(), migrations, config.migrations.clone());
//! let report = runner.run_pending().await?;
//! let factory = UnitOfWorkFactory::new(pool, registry, &report.schema, ...);
//! ```

use chrono::Utc;
use memoria_shared::config::MigrationConfig;
use memoria_storage_core::clock::{duration_millis, from_millis, now_millis};
use memoria_storage_core::{
    AppliedMigration, Migration, MigrationError, MigrationResult, MigrationSet, Result,
};
use sqlx::{Row, SqliteConnection};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::StorageMetrics;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::schema::MIGRATION_BOOTSTRAP;
use crate::sql;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Proof that the schema is current and its history verified.
///
/// Only the migration runner constructs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaReady {
    version: i64,
}

impl SchemaReady {
    pub(crate) fn new(version: i64) -> Self {
        Self { version }
    }

    pub fn version(&self) -> i64 {
        self.version
    }
}

/// Outcome of [`MigrationRunner::run_pending`]
#[derive(Debug, Clone)]
pub struct MigrationReport {
    /// Migrations applied by this run, ascending. Empty when already current.
    pub applied: Vec<MigrationResult>,
    pub schema: SchemaReady,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

pub struct MigrationRunner {
    pool: ConnectionPool,
    migrations: MigrationSet,
    config: MigrationConfig,
    owner: String,
    metrics: StorageMetrics,
}

impl MigrationRunner {
    pub fn new(pool: ConnectionPool, migrations: MigrationSet, config: MigrationConfig) -> Self {
        let metrics = pool.metrics().clone();
        Self {
            pool,
            migrations,
            config,
            owner: format!("migrator-{}", Uuid::new_v4()),
            metrics,
        }
    }

    pub fn migrations(&self) -> &MigrationSet {
        &self.migrations
    }

    /// Apply all pending migrations in ascending order.
    ///
    /// A second instance blocks on the advisory lock and then finds nothing
    /// left to apply.
    pub async fn run_pending(&self) -> Result<MigrationReport> {
        let mut conn = self.pool.acquire().await?;
        sqlx::raw_sql(MIGRATION_BOOTSTRAP).execute(&mut *conn).await?;

        if let Err(e) = self.acquire_lock(&mut conn).await {
            conn.release().await;
            return Err(e);
        }

        let outcome = self.apply_pending(&mut conn).await;
        self.release_lock(&mut conn).await;
        conn.release().await;

        let applied = outcome?;
        let schema = SchemaReady::new(self.migrations.latest_version());
        if applied.is_empty() {
            info!(version = schema.version(), "Schema up to date");
        } else {
            info!(
                applied = applied.len(),
                version = schema.version(),
                "Migrations applied"
            );
        }
        Ok(MigrationReport { applied, schema })
    }

    /// Verify recorded checksums without applying anything.
    pub async fn verify(&self) -> Result<()> {
        let history = self.applied().await?;
        self.check_history(&history)
    }

    /// Token for processes that do not migrate themselves: succeeds only when
    /// history verifies and is at the latest version.
    pub async fn ensure_current(&self) -> Result<SchemaReady> {
        let history = self.applied().await?;
        self.check_history(&history)?;

        let current = history.last().map_or(0, |m| m.version);
        let latest = self.migrations.latest_version();
        if current != latest {
            return Err(MigrationError::InvalidSequence(format!(
                "schema at version {}, this build expects {}",
                current, latest
            ))
            .into());
        }
        Ok(SchemaReady::new(current))
    }

    /// Recorded history, ascending.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>> {
        let mut conn = self.pool.acquire().await?;
        let history = async {
            sqlx::raw_sql(MIGRATION_BOOTSTRAP).execute(&mut *conn).await?;
            load_history(&mut conn).await
        }
        .await;
        conn.release().await;
        history
    }

    pub async fn current_version(&self) -> Result<i64> {
        Ok(self.applied().await?.last().map_or(0, |m| m.version))
    }

    /// Execute stored rollback scripts in descending order down to, but not
    /// including, `target`.
    ///
    /// Every script involved is checked before the first one runs; an empty
    /// or absent script fails with [`MigrationError::Irreversible`].
    pub async fn rollback_to(&self, target: i64) -> Result<Vec<MigrationResult>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::raw_sql(MIGRATION_BOOTSTRAP).execute(&mut *conn).await?;

        if let Err(e) = self.acquire_lock(&mut conn).await {
            conn.release().await;
            return Err(e);
        }

        let outcome = self.revert_to(&mut conn, target).await;
        self.release_lock(&mut conn).await;
        conn.release().await;
        outcome
    }

    async fn apply_pending(&self, conn: &mut PooledConnection) -> Result<Vec<MigrationResult>> {
        let history = load_history(conn).await?;
        self.check_history(&history)?;

        let current = history.last().map_or(0, |m| m.version);
        let mut results = Vec::new();
        for migration in self.migrations.pending_after(current) {
            results.push(self.apply_one(conn, migration).await?);
        }
        Ok(results)
    }

    async fn apply_one(
        &self,
        conn: &mut SqliteConnection,
        migration: &Migration,
    ) -> Result<MigrationResult> {
        let started = Instant::now();
        info!(
            version = migration.version,
            description = %migration.description,
            "Applying migration"
        );

        sql::begin_immediate(conn).await?;
        let applied = async {
            sqlx::raw_sql(&migration.up)
                .execute(&mut *conn)
                .await
                .map_err(|e| MigrationError::Failed {
                    version: migration.version,
                    message: e.to_string(),
                })?;

            sqlx::query(
                r#"
                INSERT INTO schema_migrations (version, checksum, description, applied_at, rollback_script)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(migration.version)
            .bind(migration.checksum())
            .bind(&migration.description)
            .bind(now_millis())
            .bind(&migration.down)
            .execute(&mut *conn)
            .await
            .map_err(MigrationError::Database)?;

            Ok::<_, MigrationError>(())
        }
        .await;

        if let Err(e) = applied {
            error!(version = migration.version, error = %e, "Migration failed");
            let _ = sql::rollback(conn).await;
            return Err(e.into());
        }
        sql::commit(conn).await?;
        self.metrics.migrations_applied.inc();

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(version = migration.version, duration_ms, "Migration applied");
        Ok(MigrationResult {
            version: migration.version,
            description: migration.description.clone(),
            executed_at: Utc::now(),
            duration_ms,
        })
    }

    async fn revert_to(
        &self,
        conn: &mut PooledConnection,
        target: i64,
    ) -> Result<Vec<MigrationResult>> {
        let history = load_history(conn).await?;
        self.check_history(&history)?;

        let to_revert: Vec<&AppliedMigration> =
            history.iter().rev().filter(|m| m.version > target).collect();
        for record in &to_revert {
            let reversible = record
                .rollback_script
                .as_deref()
                .is_some_and(|script| !script.trim().is_empty());
            if !reversible {
                return Err(MigrationError::Irreversible {
                    version: record.version,
                }
                .into());
            }
        }

        let mut results = Vec::with_capacity(to_revert.len());
        for record in to_revert {
            let started = Instant::now();
            let script = record.rollback_script.as_deref().unwrap_or_default();
            warn!(version = record.version, "Rolling back migration");

            sql::begin_immediate(conn).await?;
            let reverted = async {
                sqlx::raw_sql(script)
                    .execute(&mut **conn)
                    .await
                    .map_err(|e| MigrationError::Failed {
                        version: record.version,
                        message: e.to_string(),
                    })?;
                sqlx::query("DELETE FROM schema_migrations WHERE version = ?1")
                    .bind(record.version)
                    .execute(&mut **conn)
                    .await
                    .map_err(MigrationError::Database)?;
                Ok::<_, MigrationError>(())
            }
            .await;

            if let Err(e) = reverted {
                error!(version = record.version, error = %e, "Rollback script failed");
                let _ = sql::rollback(conn).await;
                return Err(e.into());
            }
            sql::commit(conn).await?;

            results.push(MigrationResult {
                version: record.version,
                description: record.description.clone(),
                executed_at: Utc::now(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        info!(target, reverted = results.len(), "Rollback complete");
        Ok(results)
    }

    fn check_history(&self, history: &[AppliedMigration]) -> Result<()> {
        if let Err(e) = self.migrations.verify_history(history) {
            error!(error = %e, "Migration history verification failed");
            return Err(e.into());
        }
        debug!(verified = history.len(), "Migration history verified");
        Ok(())
    }

    /// Take the advisory lock, retrying until the lock timeout.
    ///
    /// The lock row carries a lease; a holder that died is taken over once
    /// its lease expires.
    async fn acquire_lock(&self, conn: &mut SqliteConnection) -> Result<()> {
        let started = Instant::now();
        let lease = duration_millis(self.config.lock_lease());

        loop {
            let now = now_millis();
            let claimed = sqlx::query(
                r#"
                INSERT INTO schema_migration_lock (id, owner, acquired_at, expires_at)
                VALUES (1, ?1, ?2, ?3)
                ON CONFLICT (id) DO UPDATE SET
                    owner = excluded.owner,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                WHERE schema_migration_lock.expires_at <= ?2
                   OR schema_migration_lock.owner = excluded.owner
                "#,
            )
            .bind(&self.owner)
            .bind(now)
            .bind(now + lease)
            .execute(&mut *conn)
            .await;

            match claimed {
                Ok(result) if result.rows_affected() == 1 => {
                    debug!(owner = %self.owner, "Migration lock acquired");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if memoria_storage_core::error::is_lock_contention(&e) => {}
                Err(e) => return Err(e.into()),
            }

            if started.elapsed() >= self.config.lock_timeout() {
                let holder: Option<String> =
                    sqlx::query_scalar("SELECT owner FROM schema_migration_lock WHERE id = 1")
                        .fetch_optional(&mut *conn)
                        .await
                        .ok()
                        .flatten();
                return Err(MigrationError::LockTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                    holder: holder.unwrap_or_else(|| "unknown".to_string()),
                }
                .into());
            }

            debug!(owner = %self.owner, "Migration lock held elsewhere, waiting");
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn release_lock(&self, conn: &mut SqliteConnection) {
        let released = sqlx::query("DELETE FROM schema_migration_lock WHERE id = 1 AND owner = ?1")
            .bind(&self.owner)
            .execute(&mut *conn)
            .await;
        if let Err(e) = released {
            warn!(owner = %self.owner, error = %e, "Failed to release migration lock");
        }
    }
}

async fn load_history(conn: &mut SqliteConnection) -> Result<Vec<AppliedMigration>> {
    let rows = sqlx::query(
        r#"
        SELECT version, checksum, description, applied_at, rollback_script
        FROM schema_migrations
        ORDER BY version ASC
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(AppliedMigration {
                version: row.try_get("version")?,
                checksum: row.try_get("checksum")?,
                description: row.try_get("description")?,
                applied_at: from_millis(row.try_get("applied_at")?),
                rollback_script: row.try_get("rollback_script")?,
            })
        })
        .collect()
}
