//! Storage bootstrap
//!
//! [`StorageRuntime::open`] is the single entry point a service uses at
//! startup: validate configuration, open the pool, bring the schema up to
//! date, then wire the unit-of-work factory, ledger, outbox and DLQ around
//! the resulting [`SchemaReady`] token. A migration failure aborts startup.

use memoria_shared::config::{validate_storage_config, ConfigError, StorageConfigDto};
use memoria_storage_core::outbox::{JsonObjectValidator, TracingAlertSink};
use memoria_storage_core::{
    Ed25519ReceiptSigner, EventTransport, MigrationError, MigrationSet, ReceiptSigner,
    RetryPolicy, StorageError, StoreRegistry,
};
use prometheus::Registry;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::idempotency::IdempotencyStore;
use crate::ledger::ReceiptLedger;
use crate::maintenance::{MaintenanceConfig, MaintenanceTask};
use crate::metrics::StorageMetrics;
use crate::migrations::{MigrationReport, MigrationRunner, SchemaReady};
use crate::outbox::{DeadLetterQueue, OutboxStore, OutboxWorker, OutboxWorkerPool};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::unit_of_work::UnitOfWorkFactory;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Everything a service needs from the storage substrate, wired once.
pub struct StorageRuntime {
    config: StorageConfigDto,
    pool: ConnectionPool,
    metrics_registry: Registry,
    schema: SchemaReady,
    migration_report: MigrationReport,
    factory: UnitOfWorkFactory,
    ledger: Arc<ReceiptLedger>,
    idempotency: Arc<IdempotencyStore>,
    outbox: OutboxStore,
    dlq: DeadLetterQueue,
}

impl StorageRuntime {
    /// Open with a private metrics registry.
    pub async fn open(
        config: StorageConfigDto,
        registry: StoreRegistry,
        migrations: MigrationSet,
    ) -> Result<Self, RuntimeError> {
        Self::open_with_metrics(config, registry, migrations, Registry::new()).await
    }

    /// Open, registering storage metrics into `metrics_registry`.
    pub async fn open_with_metrics(
        config: StorageConfigDto,
        registry: StoreRegistry,
        migrations: MigrationSet,
        metrics_registry: Registry,
    ) -> Result<Self, RuntimeError> {
        validate_storage_config(&config)?;
        let metrics = StorageMetrics::register(&metrics_registry)?;
        let signer = signer_from_config(&config)?;

        let pool = ConnectionPool::connect(PoolConfig::from(&config.database), metrics).await?;

        let runner = MigrationRunner::new(pool.clone(), migrations, config.migrations.clone());
        let migration_report = match runner.run_pending().await {
            Ok(report) => report,
            Err(e) => {
                pool.close().await;
                return Err(e.into());
            }
        };
        let schema = migration_report.schema;

        let idempotency = Arc::new(IdempotencyStore::new(pool.metrics().clone()));
        let ledger = Arc::new(ReceiptLedger::new(pool.clone(), signer));
        let factory = UnitOfWorkFactory::new(
            pool.clone(),
            Arc::new(registry),
            &schema,
            Arc::clone(&idempotency),
            Arc::clone(&ledger),
            config.unit_of_work.clone(),
            default_retry_policy(&config),
        );

        info!(
            schema_version = schema.version(),
            migrations_applied = migration_report.applied.len(),
            max_connections = config.database.max_connections,
            stores = factory.registry().len(),
            "Storage runtime ready"
        );

        Ok(Self {
            outbox: OutboxStore::new(pool.clone()),
            dlq: DeadLetterQueue::new(pool.clone()),
            config,
            pool,
            metrics_registry,
            schema,
            migration_report,
            factory,
            ledger,
            idempotency,
        })
    }

    pub fn config(&self) -> &StorageConfigDto {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn metrics(&self) -> &StorageMetrics {
        self.pool.metrics()
    }

    pub fn metrics_registry(&self) -> &Registry {
        &self.metrics_registry
    }

    pub fn schema(&self) -> SchemaReady {
        self.schema
    }

    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration_report
    }

    pub fn units_of_work(&self) -> &UnitOfWorkFactory {
        &self.factory
    }

    pub fn ledger(&self) -> &Arc<ReceiptLedger> {
        &self.ledger
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyStore> {
        &self.idempotency
    }

    pub fn outbox(&self) -> &OutboxStore {
        &self.outbox
    }

    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    /// A single worker with the default validator and tracing alerts.
    pub fn outbox_worker(&self, transport: Arc<dyn EventTransport>) -> OutboxWorker {
        OutboxWorker::new(
            self.outbox.clone(),
            &self.schema,
            transport,
            self.config.outbox.clone(),
            Arc::new(JsonObjectValidator),
            Arc::new(TracingAlertSink),
        )
    }

    /// Spawn the configured number of workers.
    pub fn spawn_outbox_workers(&self, transport: Arc<dyn EventTransport>) -> OutboxWorkerPool {
        OutboxWorkerPool::spawn(
            self.config.outbox.workers as usize,
            self.outbox.clone(),
            &self.schema,
            transport,
            self.config.outbox.clone(),
            Arc::new(JsonObjectValidator),
            Arc::new(TracingAlertSink),
        )
    }

    pub fn maintenance_task(&self) -> MaintenanceTask {
        MaintenanceTask::new(
            MaintenanceConfig::from_outbox(&self.config.outbox),
            self.pool.clone(),
            Arc::clone(&self.idempotency),
        )
    }

    /// Close the pool. Leased connections are retired as they come back.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Storage runtime closed");
    }
}

impl std::fmt::Debug for StorageRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRuntime")
            .field("schema", &self.schema)
            .field("pool", &self.pool)
            .field("factory", &self.factory)
            .finish()
    }
}

fn signer_from_config(config: &StorageConfigDto) -> Result<Arc<dyn ReceiptSigner>, RuntimeError> {
    match config.ledger.signing_key_hex.as_deref() {
        Some(seed) => Ok(Arc::new(Ed25519ReceiptSigner::from_seed_hex(seed)?)),
        None => {
            warn!("No ledger signing key configured, using the development key");
            Ok(Arc::new(Ed25519ReceiptSigner::development()))
        }
    }
}

fn default_retry_policy(config: &StorageConfigDto) -> RetryPolicy {
    let outbox = &config.outbox;
    RetryPolicy::new(
        outbox.max_attempts,
        outbox.base_delay_ms,
        outbox.max_delay_ms,
        outbox.backoff_multiplier,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_policy_follows_outbox_config() {
        let mut config = StorageConfigDto::with_database_url("sqlite::memory:");
        config.outbox.max_attempts = 3;
        config.outbox.base_delay_ms = 250;

        let policy = default_retry_policy(&config);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 250);
        assert_eq!(policy.max_delay_ms, config.outbox.max_delay_ms);
    }

    #[test]
    fn test_malformed_signing_key_is_rejected() {
        let mut config = StorageConfigDto::with_database_url("sqlite::memory:");
        config.ledger.signing_key_hex = Some("zz".to_string());
        assert!(matches!(
            signer_from_config(&config),
            Err(RuntimeError::Storage(_))
        ));
    }
}
