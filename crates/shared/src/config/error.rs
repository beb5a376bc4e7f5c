//! Errors raised while loading or validating [`StorageConfigDto`](super::StorageConfigDto).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// A `MEMORIA_*` variable the substrate cannot start without is unset
    #[error("Missing required configuration: {var}")]
    MissingRequired { var: String },

    /// A variable is set but does not parse
    #[error("Invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    #[error("Failed to load env file {path}: {source}")]
    EnvFileLoad {
        path: PathBuf,
        #[source]
        source: dotenv::Error,
    },

    /// Values parse but contradict each other or a storage constraint
    #[error("Configuration validation failed: {0}")]
    Validation(String),

    /// Not a `sqlite:` connection string
    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_variable() {
        let missing = ConfigError::MissingRequired {
            var: "MEMORIA_DATABASE_URL".to_string(),
        };
        assert_eq!(
            missing.to_string(),
            "Missing required configuration: MEMORIA_DATABASE_URL"
        );

        let invalid = ConfigError::InvalidValue {
            var: "MEMORIA_OUTBOX_JITTER".to_string(),
            value: "abc".to_string(),
        };
        assert_eq!(invalid.to_string(), "Invalid value for MEMORIA_OUTBOX_JITTER: abc");
    }

    #[test]
    fn test_database_url_message() {
        let err = ConfigError::InvalidDatabaseUrl("postgres://db".to_string());
        assert!(err.to_string().starts_with("Invalid database URL"));
    }
}
