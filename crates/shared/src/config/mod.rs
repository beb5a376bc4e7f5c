//! Environment-driven configuration for the Memoria storage substrate
//!
//! Everything is read once at startup into a [`StorageConfigDto`] and handed
//! down by value. Malformed values are errors; only unset optional variables
//! fall back to defaults. A `.env` file, when given, is applied before the
//! process environment is read.
//!
//! # Usage
//!
//! ```ignore
//! use memoria_shared::config::ConfigLoader;
//! use std::path::PathBuf;
//!
//! let loader = ConfigLoader::new(Some(PathBuf::from(".env")));
//! let config = loader.load_storage_config()?;
//! println!("Pool capacity: {}", config.database.max_connections);
//! ```
//!
//! # Environment Variables
//!
//! - `MEMORIA_DATABASE_URL` (required): SQLite connection string
//! - `MEMORIA_DB_*`, `MEMORIA_UOW_*`, `MEMORIA_IDEMPOTENCY_*`,
//!   `MEMORIA_OUTBOX_*`, `MEMORIA_LEDGER_*`, `MEMORIA_MIGRATION_*`,
//!   `MEMORIA_LOG_*` (optional)

pub mod dto;
pub mod error;
pub mod loader;
pub mod validator;

pub use dto::{
    DatabaseConfig, LedgerConfig, LoggingConfig, MigrationConfig, OutboxConfig,
    StorageConfigDto, UnitOfWorkConfig,
};
pub use error::{ConfigError, Result};
pub use loader::ConfigLoader;
pub use validator::{
    validate_database_url, validate_ledger_config, validate_outbox_config, validate_pool_config,
    validate_storage_config,
};
