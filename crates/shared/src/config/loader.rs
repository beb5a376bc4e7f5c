//! Configuration loader
//!
//! This module provides the ConfigLoader which is responsible for loading
//! configuration from .env files and environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::dto::{
    DatabaseConfig, LedgerConfig, LoggingConfig, MigrationConfig, OutboxConfig,
    StorageConfigDto, UnitOfWorkConfig,
};
use super::error::{ConfigError, Result};
use super::validator::validate_storage_config;
use crate::states::InFlightPolicy;

/// Configuration loader
///
/// Loads an optional `.env` file first, then reads `MEMORIA_*` variables
/// from the process environment and validates the result.
///
/// # Example
///
/// ```ignore
/// use memoria_shared::config::ConfigLoader;
/// use std::path::PathBuf;
///
/// let loader = ConfigLoader::new(Some(PathBuf::from(".env")));
/// let config = loader.load_storage_config()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    /// Optional path to .env file
    env_file_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new ConfigLoader
    ///
    /// ```
    /// use memoria_shared::config::ConfigLoader;
    ///
    /// let loader = ConfigLoader::new(None);
    /// let with_file = ConfigLoader::new(Some(".env".into()));
    /// ```
    pub fn new(env_file_path: Option<PathBuf>) -> Self {
        Self { env_file_path }
    }

    /// Load and validate the storage configuration.
    pub fn load_storage_config(&self) -> Result<StorageConfigDto> {
        if let Some(path) = &self.env_file_path {
            self.load_env_file(path)?;
        }

        let config = StorageConfigDto::from_env()?;
        validate_storage_config(&config)?;

        Ok(config)
    }

    fn load_env_file(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(ConfigError::EnvFileLoad {
                path: path.to_path_buf(),
                source: dotenv::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("File not found: {}", path.display()),
                )),
            });
        }

        dotenv::from_path(path).map_err(|e| ConfigError::EnvFileLoad {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }
}

// ============================================================================
// Implementation: StorageConfigDto::from_env / from_lookup
// ============================================================================

impl StorageConfigDto {
    /// Build storage configuration from environment variables
    ///
    /// # Required Environment Variables
    ///
    /// - `MEMORIA_DATABASE_URL`: SQLite connection string
    ///
    /// Every other variable is optional; see the section builders below
    /// for names and defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|var: &str| std::env::var(var).ok())
    }

    /// Build storage configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            database: DatabaseConfig::from_lookup(lookup)?,
            unit_of_work: UnitOfWorkConfig::from_lookup(lookup)?,
            outbox: OutboxConfig::from_lookup(lookup)?,
            ledger: LedgerConfig::from_lookup(lookup),
            migrations: MigrationConfig::from_lookup(lookup)?,
            logging: LoggingConfig::from_lookup(lookup)?,
        })
    }
}

impl DatabaseConfig {
    /// # Variables
    ///
    /// - `MEMORIA_DATABASE_URL` (required)
    /// - `MEMORIA_DB_MAX_CONNECTIONS`: Default 5
    /// - `MEMORIA_DB_ACQUIRE_TIMEOUT_MS`: Default 5000
    /// - `MEMORIA_DB_BUSY_TIMEOUT_MS`: Default 5000
    /// - `MEMORIA_DB_HEALTH_CHECK`: Default true
    pub fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("MEMORIA_DATABASE_URL").ok_or_else(|| ConfigError::MissingRequired {
            var: "MEMORIA_DATABASE_URL".to_string(),
        })?;
        let defaults = Self::default();

        Ok(Self {
            url,
            max_connections: parse_optional_var(
                lookup,
                "MEMORIA_DB_MAX_CONNECTIONS",
                defaults.max_connections,
            )?,
            acquire_timeout_ms: parse_optional_var(
                lookup,
                "MEMORIA_DB_ACQUIRE_TIMEOUT_MS",
                defaults.acquire_timeout_ms,
            )?,
            busy_timeout_ms: parse_optional_var(
                lookup,
                "MEMORIA_DB_BUSY_TIMEOUT_MS",
                defaults.busy_timeout_ms,
            )?,
            health_check_on_release: parse_bool_var(
                lookup,
                "MEMORIA_DB_HEALTH_CHECK",
                defaults.health_check_on_release,
            )?,
        })
    }
}

impl UnitOfWorkConfig {
    /// # Variables
    ///
    /// - `MEMORIA_UOW_IN_FLIGHT_POLICY`: `wait` | `fail`, default wait
    /// - `MEMORIA_UOW_IN_FLIGHT_TIMEOUT_MS`: Default 10000
    /// - `MEMORIA_IDEMPOTENCY_TTL_SECS`: Default 86400
    /// - `MEMORIA_IDEMPOTENCY_RESERVATION_SECS`: Default 300
    pub fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let in_flight_policy = match lookup("MEMORIA_UOW_IN_FLIGHT_POLICY") {
            Some(raw) => InFlightPolicy::from_str(&raw).map_err(|_| ConfigError::InvalidValue {
                var: "MEMORIA_UOW_IN_FLIGHT_POLICY".to_string(),
                value: raw,
            })?,
            None => defaults.in_flight_policy,
        };

        Ok(Self {
            in_flight_policy,
            in_flight_timeout_ms: parse_optional_var(
                lookup,
                "MEMORIA_UOW_IN_FLIGHT_TIMEOUT_MS",
                defaults.in_flight_timeout_ms,
            )?,
            idempotency_ttl_secs: parse_optional_var(
                lookup,
                "MEMORIA_IDEMPOTENCY_TTL_SECS",
                defaults.idempotency_ttl_secs,
            )?,
            reservation_lease_secs: parse_optional_var(
                lookup,
                "MEMORIA_IDEMPOTENCY_RESERVATION_SECS",
                defaults.reservation_lease_secs,
            )?,
        })
    }
}

impl OutboxConfig {
    /// # Variables
    ///
    /// `MEMORIA_OUTBOX_BATCH_SIZE`, `MEMORIA_OUTBOX_POLL_INTERVAL_MS`,
    /// `MEMORIA_OUTBOX_LEASE_SECS`, `MEMORIA_OUTBOX_PUBLISH_TIMEOUT_MS`,
    /// `MEMORIA_OUTBOX_WORKERS`, `MEMORIA_OUTBOX_JITTER`,
    /// `MEMORIA_OUTBOX_MAX_ATTEMPTS`, `MEMORIA_OUTBOX_BASE_DELAY_MS`,
    /// `MEMORIA_OUTBOX_MAX_DELAY_MS`, `MEMORIA_OUTBOX_BACKOFF_MULTIPLIER`,
    /// `MEMORIA_OUTBOX_RETENTION_DAYS`
    pub fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();

        Ok(Self {
            batch_size: parse_optional_var(lookup, "MEMORIA_OUTBOX_BATCH_SIZE", d.batch_size)?,
            poll_interval_ms: parse_optional_var(
                lookup,
                "MEMORIA_OUTBOX_POLL_INTERVAL_MS",
                d.poll_interval_ms,
            )?,
            lease_secs: parse_optional_var(lookup, "MEMORIA_OUTBOX_LEASE_SECS", d.lease_secs)?,
            publish_timeout_ms: parse_optional_var(
                lookup,
                "MEMORIA_OUTBOX_PUBLISH_TIMEOUT_MS",
                d.publish_timeout_ms,
            )?,
            workers: parse_optional_var(lookup, "MEMORIA_OUTBOX_WORKERS", d.workers)?,
            jitter: parse_optional_var(lookup, "MEMORIA_OUTBOX_JITTER", d.jitter)?,
            max_attempts: parse_optional_var(lookup, "MEMORIA_OUTBOX_MAX_ATTEMPTS", d.max_attempts)?,
            base_delay_ms: parse_optional_var(
                lookup,
                "MEMORIA_OUTBOX_BASE_DELAY_MS",
                d.base_delay_ms,
            )?,
            max_delay_ms: parse_optional_var(lookup, "MEMORIA_OUTBOX_MAX_DELAY_MS", d.max_delay_ms)?,
            backoff_multiplier: parse_optional_var(
                lookup,
                "MEMORIA_OUTBOX_BACKOFF_MULTIPLIER",
                d.backoff_multiplier,
            )?,
            retention_days: parse_optional_var(
                lookup,
                "MEMORIA_OUTBOX_RETENTION_DAYS",
                d.retention_days,
            )?,
        })
    }
}

impl LedgerConfig {
    /// - `MEMORIA_LEDGER_SIGNING_KEY`: hex Ed25519 seed (optional)
    pub fn from_lookup<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            signing_key_hex: lookup("MEMORIA_LEDGER_SIGNING_KEY")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        }
    }
}

impl MigrationConfig {
    /// - `MEMORIA_MIGRATION_LOCK_TIMEOUT_MS`: Default 30000
    /// - `MEMORIA_MIGRATION_LOCK_LEASE_SECS`: Default 300
    pub fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        Ok(Self {
            lock_timeout_ms: parse_optional_var(
                lookup,
                "MEMORIA_MIGRATION_LOCK_TIMEOUT_MS",
                d.lock_timeout_ms,
            )?,
            lock_lease_secs: parse_optional_var(
                lookup,
                "MEMORIA_MIGRATION_LOCK_LEASE_SECS",
                d.lock_lease_secs,
            )?,
        })
    }
}

impl LoggingConfig {
    /// - `MEMORIA_LOG_LEVEL` or `RUST_LOG`: Default "info"
    /// - `MEMORIA_LOG_JSON`: Default false
    pub fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = lookup("MEMORIA_LOG_LEVEL")
            .or_else(|| lookup("RUST_LOG"))
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            level,
            json: parse_bool_var(lookup, "MEMORIA_LOG_JSON", false)?,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Parse an optional variable, falling back to `default` when unset.
/// A value that is present but malformed is an error rather than a silent default.
fn parse_optional_var<F, T>(lookup: &F, var: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

fn parse_bool_var<F>(lookup: &F, var: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                var: var.to_string(),
                value: raw,
            }),
        },
        None => Ok(default),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_config_loader_new() {
        let loader = ConfigLoader::new(None);
        assert!(loader.env_file_path.is_none());

        let loader = ConfigLoader::new(Some(PathBuf::from(".env")));
        assert_eq!(loader.env_file_path, Some(PathBuf::from(".env")));
    }

    #[test]
    fn test_missing_database_url() {
        let lookup = lookup_from(&[]);
        let err = StorageConfigDto::from_lookup(&lookup).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { var } if var == "MEMORIA_DATABASE_URL"));
    }

    #[test]
    fn test_defaults_when_only_url_is_set() {
        let lookup = lookup_from(&[("MEMORIA_DATABASE_URL", "sqlite://memoria.db")]);
        let config = StorageConfigDto::from_lookup(&lookup).unwrap();

        assert_eq!(config.database.url, "sqlite://memoria.db");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.unit_of_work.in_flight_policy, InFlightPolicy::Wait);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_overrides_are_parsed() {
        let lookup = lookup_from(&[
            ("MEMORIA_DATABASE_URL", "sqlite://memoria.db"),
            ("MEMORIA_DB_MAX_CONNECTIONS", "8"),
            ("MEMORIA_DB_HEALTH_CHECK", "off"),
            ("MEMORIA_UOW_IN_FLIGHT_POLICY", "fail"),
            ("MEMORIA_OUTBOX_JITTER", "0.1"),
            ("MEMORIA_OUTBOX_BACKOFF_MULTIPLIER", "3.0"),
            ("MEMORIA_LEDGER_SIGNING_KEY", "  "),
            ("RUST_LOG", "debug"),
        ]);
        let config = StorageConfigDto::from_lookup(&lookup).unwrap();

        assert_eq!(config.database.max_connections, 8);
        assert!(!config.database.health_check_on_release);
        assert_eq!(config.unit_of_work.in_flight_policy, InFlightPolicy::Fail);
        assert_eq!(config.outbox.jitter, 0.1);
        assert_eq!(config.outbox.backoff_multiplier, 3.0);
        assert!(config.ledger.signing_key_hex.is_none());
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_malformed_value_is_rejected() {
        let lookup = lookup_from(&[
            ("MEMORIA_DATABASE_URL", "sqlite://memoria.db"),
            ("MEMORIA_OUTBOX_BATCH_SIZE", "lots"),
        ]);
        let err = StorageConfigDto::from_lookup(&lookup).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var, .. } if var == "MEMORIA_OUTBOX_BATCH_SIZE"));
    }

    #[test]
    fn test_missing_env_file_is_reported() {
        let loader = ConfigLoader::new(Some(PathBuf::from("/definitely/not/here/.env")));
        let err = loader.load_storage_config().unwrap_err();
        assert!(matches!(err, ConfigError::EnvFileLoad { .. }));
    }
}
