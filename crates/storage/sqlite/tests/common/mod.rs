#![allow(dead_code)]

use async_trait::async_trait;
use memoria_shared::config::StorageConfigDto;
use memoria_shared::UnitOfWorkId;
use memoria_storage_core::outbox::AlertSink;
use memoria_storage_core::{
    DlqEntry, EventTransport, Migration, MigrationSet, ParticipationContext, Result,
    StorageError, Store, StoreContribution, StoreHandle, StoreRegistry, TransportError,
    TransportMessage,
};
use memoria_storage_sqlite::schema::core_migration_set;
use memoria_storage_sqlite::StorageRuntime;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const NOTES_STORE: &str = "notes";

pub const NOTES_MIGRATION: &str = r#"
CREATE TABLE notes (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    unit_of_work_id TEXT NOT NULL
);
"#;

/// File-backed SQLite database in a temporary directory.
pub struct TestDatabase {
    pub url: String,
    _dir: TempDir,
}

impl TestDatabase {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let url = format!("sqlite://{}", dir.path().join("memoria.db").display());
        Ok(Self { url, _dir: dir })
    }

    pub fn config(&self) -> StorageConfigDto {
        let mut config = StorageConfigDto::with_database_url(&self.url);
        config.database.max_connections = 4;
        config.database.acquire_timeout_ms = 2_000;
        config.unit_of_work.in_flight_timeout_ms = 2_000;
        config.outbox.poll_interval_ms = 20;
        config.outbox.jitter = 0.0;
        config.outbox.publish_timeout_ms = 1_000;
        config
    }
}

pub fn notes_migration() -> Migration {
    Migration::new(5, "notes table", NOTES_MIGRATION).with_down("DROP TABLE IF EXISTS notes;")
}

pub fn app_migrations() -> anyhow::Result<MigrationSet> {
    Ok(core_migration_set()?.extend(vec![notes_migration()])?)
}

/// Key/value store writing the `notes` table. Writes are staged per unit of
/// work and applied when that unit commits.
#[derive(Default)]
pub struct NotesStore {
    staged: Mutex<HashMap<UnitOfWorkId, Vec<(String, String)>>>,
    fail_next: AtomicBool,
    pub commits: AtomicU64,
    pub rollbacks: AtomicU64,
}

impl NotesStore {
    pub fn stage(&self, unit_of_work_id: UnitOfWorkId, key: &str, value: &str) {
        self.staged
            .lock()
            .entry(unit_of_work_id)
            .or_default()
            .push((key.to_string(), value.to_string()));
    }

    /// Make the next `participate` call fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for NotesStore {
    fn name(&self) -> &str {
        NOTES_STORE
    }

    async fn participate(&self, ctx: &mut ParticipationContext<'_>) -> Result<StoreContribution> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StorageError::store(NOTES_STORE, "injected failure"));
        }

        let unit_of_work_id = ctx.unit_of_work_id();
        let writes = self
            .staged
            .lock()
            .get(&unit_of_work_id)
            .cloned()
            .unwrap_or_default();
        for (key, value) in &writes {
            sqlx::query("INSERT INTO notes (key, value, unit_of_work_id) VALUES (?1, ?2, ?3)")
                .bind(key)
                .bind(value)
                .bind(unit_of_work_id.to_string())
                .execute(ctx.connection())
                .await?;
        }
        Ok(StoreContribution::new(NOTES_STORE, writes.len() as u64))
    }

    async fn on_commit(&self, unit_of_work_id: UnitOfWorkId) {
        self.staged.lock().remove(&unit_of_work_id);
        self.commits.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_rollback(&self, unit_of_work_id: UnitOfWorkId) {
        self.staged.lock().remove(&unit_of_work_id);
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
    }
}

/// A runtime over a fresh database with the notes store registered.
pub struct TestHarness {
    pub runtime: StorageRuntime,
    pub notes: Arc<NotesStore>,
    pub notes_handle: StoreHandle,
    pub db: TestDatabase,
}

impl TestHarness {
    pub async fn new() -> anyhow::Result<Self> {
        let db = TestDatabase::new()?;
        Self::with_config(db, |_| {}).await
    }

    pub async fn with_config(
        db: TestDatabase,
        configure: impl FnOnce(&mut StorageConfigDto),
    ) -> anyhow::Result<Self> {
        let mut config = db.config();
        configure(&mut config);

        let notes = Arc::new(NotesStore::default());
        let mut registry = StoreRegistry::new();
        let notes_handle = registry.register(notes.clone())?;

        let runtime = StorageRuntime::open(config, registry, app_migrations()?).await?;
        Ok(Self {
            runtime,
            notes,
            notes_handle,
            db,
        })
    }

    pub async fn note(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.runtime.pool().acquire().await?;
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM notes WHERE key = ?1")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
        conn.release().await;
        Ok(value)
    }

    pub async fn count(&self, table: &str) -> anyhow::Result<i64> {
        let mut conn = self.runtime.pool().acquire().await?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&mut *conn)
            .await?;
        conn.release().await;
        Ok(count)
    }

    pub async fn execute(&self, statement: &str) -> anyhow::Result<u64> {
        let mut conn = self.runtime.pool().acquire().await?;
        let result = sqlx::query(statement).execute(&mut *conn).await?;
        conn.release().await;
        Ok(result.rows_affected())
    }
}

/// Transport that records published messages and replays scripted failures.
#[derive(Default)]
pub struct RecordingTransport {
    published: Mutex<Vec<TransportMessage>>,
    script: Mutex<VecDeque<TransportError>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next publish calls with these errors, in order.
    pub fn fail_with(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.script.lock().extend(errors);
    }

    pub fn delay_publishes(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn published(&self) -> Vec<TransportMessage> {
        self.published.lock().clone()
    }

    pub fn published_sequence(&self, aggregate_id: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.headers.aggregate_id == aggregate_id)
            .map(|m| m.headers.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl EventTransport for RecordingTransport {
    async fn publish(&self, message: &TransportMessage) -> std::result::Result<(), TransportError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        self.published.lock().push(message.clone());
        Ok(())
    }
}

/// Alert sink that keeps every dead-lettered entry.
#[derive(Default)]
pub struct CollectingAlertSink {
    entries: Mutex<Vec<DlqEntry>>,
}

impl CollectingAlertSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<DlqEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl AlertSink for CollectingAlertSink {
    async fn dead_lettered(&self, entry: &DlqEntry) {
        self.entries.lock().push(entry.clone());
    }
}
