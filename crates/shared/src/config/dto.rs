//! Configuration Data Transfer Objects (DTOs)
//!
//! Immutable configuration for the storage substrate. Loaded once at startup
//! and handed to the runtime, which splits it into per-component settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::states::InFlightPolicy;

// ============================================================================
// Storage Configuration DTOs
// ============================================================================

/// Configuration DTO for the storage substrate
///
/// # Example
///
/// ```ignore
/// use memoria_shared::config::StorageConfigDto;
///
/// let config = StorageConfigDto::from_env()?;
/// println!("Database: {}", config.database.url);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfigDto {
    /// Embedded database and pool configuration
    pub database: DatabaseConfig,

    /// Unit of work and idempotency configuration
    pub unit_of_work: UnitOfWorkConfig,

    /// Outbox worker configuration
    pub outbox: OutboxConfig,

    /// Receipt ledger configuration
    pub ledger: LedgerConfig,

    /// Schema migration configuration
    pub migrations: MigrationConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl StorageConfigDto {
    /// Configuration with defaults for everything except the database URL.
    pub fn with_database_url(url: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig {
                url: url.into(),
                ..DatabaseConfig::default()
            },
            unit_of_work: UnitOfWorkConfig::default(),
            outbox: OutboxConfig::default(),
            ledger: LedgerConfig::default(),
            migrations: MigrationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection string
    /// Example: `sqlite://data/memoria.db`
    pub url: String,

    /// Hard upper bound of simultaneously leased connections
    pub max_connections: u32,

    /// How long `acquire` waits before failing with `PoolExhausted` (milliseconds)
    pub acquire_timeout_ms: u64,

    /// Engine-level lock wait before a write reports busy (milliseconds)
    pub busy_timeout_ms: u64,

    /// Ping connections when they are returned to the pool
    pub health_check_on_release: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 5,
            acquire_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            health_check_on_release: true,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Unit of work and idempotency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOfWorkConfig {
    /// What a duplicate caller does while the same key is executing
    pub in_flight_policy: InFlightPolicy,

    /// Upper bound for waiting on an in-flight key (milliseconds)
    pub in_flight_timeout_ms: u64,

    /// Lifetime of a cached idempotent result (seconds)
    pub idempotency_ttl_secs: u64,

    /// Lifetime of an in-flight reservation before another caller may take it over (seconds)
    pub reservation_lease_secs: u64,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            in_flight_policy: InFlightPolicy::Wait,
            in_flight_timeout_ms: 10_000,
            idempotency_ttl_secs: 86_400,
            reservation_lease_secs: 300,
        }
    }
}

impl UnitOfWorkConfig {
    pub fn in_flight_timeout(&self) -> Duration {
        Duration::from_millis(self.in_flight_timeout_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn reservation_lease(&self) -> Duration {
        Duration::from_secs(self.reservation_lease_secs)
    }
}

/// Outbox worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Maximum events leased per poll
    pub batch_size: u32,

    /// Interval between polls (milliseconds)
    pub poll_interval_ms: u64,

    /// Lease held on claimed events (seconds)
    pub lease_secs: u64,

    /// Timeout for a single publish call (milliseconds)
    pub publish_timeout_ms: u64,

    /// Number of concurrent worker instances
    pub workers: u32,

    /// Multiplicative jitter range: delays are scaled by [1 - jitter, 1 + jitter]
    pub jitter: f64,

    /// Default retry policy stamped on new events
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,

    /// Delivered events older than this are purged by maintenance (days)
    pub retention_days: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 500,
            lease_secs: 30,
            publish_timeout_ms: 10_000,
            workers: 1,
            jitter: 0.25,
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            backoff_multiplier: 2.0,
            retention_days: 7,
        }
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Receipt ledger configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Hex-encoded 32-byte Ed25519 seed used to sign receipts
    pub signing_key_hex: Option<String>,
}

/// Schema migration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// How long to wait for another process holding the migration lock (milliseconds)
    pub lock_timeout_ms: u64,

    /// Lease on the migration lock; a crashed holder loses it after this (seconds)
    pub lock_lease_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
            lock_lease_secs: 300,
        }
    }
}

impl MigrationConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,

    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_documented_values() {
        let config = StorageConfigDto::with_database_url("sqlite://memoria.db");

        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.database.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(config.unit_of_work.in_flight_policy, InFlightPolicy::Wait);
        assert_eq!(config.unit_of_work.idempotency_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.outbox.jitter, 0.25);
        assert_eq!(config.outbox.backoff_multiplier, 2.0);
        assert!(config.ledger.signing_key_hex.is_none());
    }

    #[test]
    fn test_storage_config_dto_serialization() {
        let config = StorageConfigDto::with_database_url("sqlite://memoria.db");

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: StorageConfigDto = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.database.url, "sqlite://memoria.db");
        assert_eq!(deserialized.outbox.batch_size, 100);
        assert_eq!(deserialized.migrations.lock_lease_secs, 300);
    }
}
