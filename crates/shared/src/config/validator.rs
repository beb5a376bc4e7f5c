//! Configuration validation
//!
//! This module provides validation logic for configuration DTOs.

use super::dto::{DatabaseConfig, LedgerConfig, OutboxConfig, StorageConfigDto};
use super::error::{ConfigError, Result};

/// Validate a database URL format
///
/// Accepts `sqlite:` URLs, including `sqlite::memory:` and `sqlite://path`.
pub fn validate_database_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(ConfigError::InvalidDatabaseUrl(
            "Database URL cannot be empty".to_string(),
        ));
    }

    if !url.starts_with("sqlite:") {
        return Err(ConfigError::InvalidDatabaseUrl(format!(
            "Database URL must start with sqlite:, got: {}",
            url
        )));
    }

    if url.trim_start_matches("sqlite:").trim_start_matches("//").is_empty() {
        return Err(ConfigError::InvalidDatabaseUrl(format!(
            "Database URL has no path: {}",
            url
        )));
    }

    Ok(())
}

/// Validate pool configuration
pub fn validate_pool_config(config: &DatabaseConfig) -> Result<()> {
    if config.max_connections == 0 {
        return Err(ConfigError::Validation(
            "max_connections must be greater than 0".to_string(),
        ));
    }

    if config.acquire_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "acquire_timeout_ms must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Validate outbox worker and retry configuration
pub fn validate_outbox_config(config: &OutboxConfig) -> Result<()> {
    if config.batch_size == 0 {
        return Err(ConfigError::Validation(
            "outbox batch_size must be greater than 0".to_string(),
        ));
    }

    if config.workers == 0 {
        return Err(ConfigError::Validation(
            "outbox workers must be greater than 0".to_string(),
        ));
    }

    if !(0.0..1.0).contains(&config.jitter) {
        return Err(ConfigError::Validation(format!(
            "outbox jitter must be in [0, 1), got {}",
            config.jitter
        )));
    }

    if config.backoff_multiplier < 1.0 || !config.backoff_multiplier.is_finite() {
        return Err(ConfigError::Validation(format!(
            "backoff_multiplier must be >= 1.0, got {}",
            config.backoff_multiplier
        )));
    }

    if config.max_attempts == 0 {
        return Err(ConfigError::Validation(
            "max_attempts must be greater than 0".to_string(),
        ));
    }

    if config.base_delay_ms > config.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "base_delay_ms ({}) cannot exceed max_delay_ms ({})",
            config.base_delay_ms, config.max_delay_ms
        )));
    }

    Ok(())
}

/// Validate the receipt signing key, if one is configured
pub fn validate_ledger_config(config: &LedgerConfig) -> Result<()> {
    if let Some(key) = &config.signing_key_hex {
        if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::InvalidValue {
                var: "MEMORIA_LEDGER_SIGNING_KEY".to_string(),
                value: "expected 64 hex characters".to_string(),
            });
        }
    }

    Ok(())
}

/// Validate complete storage configuration
pub fn validate_storage_config(config: &StorageConfigDto) -> Result<()> {
    validate_database_url(&config.database.url)?;
    validate_pool_config(&config.database)?;
    validate_outbox_config(&config.outbox)?;
    validate_ledger_config(&config.ledger)?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("sqlite://data/memoria.db")]
    #[case("sqlite::memory:")]
    #[case("sqlite:memoria.db?mode=rwc")]
    fn test_validate_database_url_valid(#[case] url: &str) {
        assert!(validate_database_url(url).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("postgres://localhost:5432/db")]
    #[case("sqlite://")]
    fn test_validate_database_url_invalid(#[case] url: &str) {
        assert!(validate_database_url(url).is_err());
    }

    #[test]
    fn test_validate_pool_config_zero_connections() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 0,
            ..DatabaseConfig::default()
        };
        assert!(validate_pool_config(&config).is_err());
    }

    #[rstest]
    #[case(|c: &mut OutboxConfig| c.jitter = 1.0)]
    #[case(|c: &mut OutboxConfig| c.jitter = -0.1)]
    #[case(|c: &mut OutboxConfig| c.backoff_multiplier = 0.5)]
    #[case(|c: &mut OutboxConfig| c.max_attempts = 0)]
    #[case(|c: &mut OutboxConfig| c.batch_size = 0)]
    #[case(|c: &mut OutboxConfig| c.base_delay_ms = c.max_delay_ms + 1)]
    fn test_validate_outbox_config_rejects(#[case] mutate: fn(&mut OutboxConfig)) {
        let mut config = OutboxConfig::default();
        mutate(&mut config);
        assert!(validate_outbox_config(&config).is_err());
    }

    #[test]
    fn test_validate_outbox_config_defaults() {
        assert!(validate_outbox_config(&OutboxConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_ledger_key() {
        let ok = LedgerConfig {
            signing_key_hex: Some("ab".repeat(32)),
        };
        assert!(validate_ledger_config(&ok).is_ok());

        let bad = LedgerConfig {
            signing_key_hex: Some("xyz".to_string()),
        };
        assert!(validate_ledger_config(&bad).is_err());
    }
}
