//! Versioned schema migrations: definitions, checksums and history checks.
//!
//! Versions start at 1 and form a strict, gap-free ascending sequence. The
//! checksum of a migration is the SHA-256 of its `up` script; once applied it
//! is re-verified on every run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::sha256;

/// Errors raised while validating or applying migrations
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration {version} checksum mismatch: recorded {recorded}, computed {computed}")]
    ChecksumMismatch {
        version: i64,
        recorded: String,
        computed: String,
    },

    #[error("Invalid migration sequence: {0}")]
    InvalidSequence(String),

    #[error("Applied migration {version} is not known to this build")]
    UnknownAppliedVersion { version: i64 },

    #[error("Timed out after {waited_ms}ms waiting for the migration lock held by {holder}")]
    LockTimeout { waited_ms: u64, holder: String },

    #[error("Migration {version} has no rollback script")]
    Irreversible { version: i64 },

    #[error("Migration {version} failed: {message}")]
    Failed { version: i64, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One schema change unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub description: String,
    pub up: String,
    pub down: Option<String>,
}

impl Migration {
    pub fn new(version: i64, description: impl Into<String>, up: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
            up: up.into(),
            down: None,
        }
    }

    pub fn with_down(mut self, down: impl Into<String>) -> Self {
        self.down = Some(down.into());
        self
    }

    /// Hex SHA-256 of the `up` script.
    pub fn checksum(&self) -> String {
        hex::encode(sha256(self.up.as_bytes()))
    }
}

/// Row of the migration history table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub version: i64,
    pub checksum: String,
    pub description: String,
    pub applied_at: DateTime<Utc>,
    pub rollback_script: Option<String>,
}

/// Result of applying (or rolling back) one migration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    pub version: i64,
    pub description: String,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// An ordered, validated collection of migrations
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    /// Versions must be exactly `1..=n` in order.
    pub fn new(migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        for (index, migration) in migrations.iter().enumerate() {
            let expected = index as i64 + 1;
            if migration.version != expected {
                return Err(MigrationError::InvalidSequence(format!(
                    "expected version {} at position {}, found {}",
                    expected, index, migration.version
                )));
            }
            if migration.up.trim().is_empty() {
                return Err(MigrationError::InvalidSequence(format!(
                    "migration {} has an empty script",
                    migration.version
                )));
            }
        }
        Ok(Self { migrations })
    }

    /// Append migrations that continue the numbering.
    pub fn extend(self, more: Vec<Migration>) -> Result<Self, MigrationError> {
        let mut all = self.migrations;
        all.extend(more);
        Self::new(all)
    }

    pub fn latest_version(&self) -> i64 {
        self.migrations.last().map_or(0, |m| m.version)
    }

    pub fn get(&self, version: i64) -> Option<&Migration> {
        usize::try_from(version - 1)
            .ok()
            .and_then(|index| self.migrations.get(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    /// Migrations newer than `version`, ascending.
    pub fn pending_after(&self, version: i64) -> impl Iterator<Item = &Migration> {
        self.migrations.iter().filter(move |m| m.version > version)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Check recorded history against this set.
    ///
    /// History must be the gap-free prefix `1..=k` and every recorded checksum
    /// must match the script this build would apply.
    pub fn verify_history(&self, applied: &[AppliedMigration]) -> Result<(), MigrationError> {
        for (index, record) in applied.iter().enumerate() {
            let expected = index as i64 + 1;
            if record.version != expected {
                return Err(MigrationError::InvalidSequence(format!(
                    "history expected version {}, found {}",
                    expected, record.version
                )));
            }

            let migration = self
                .get(record.version)
                .ok_or(MigrationError::UnknownAppliedVersion {
                    version: record.version,
                })?;

            let computed = migration.checksum();
            if computed != record.checksum {
                return Err(MigrationError::ChecksumMismatch {
                    version: record.version,
                    recorded: record.checksum.clone(),
                    computed,
                });
            }
        }
        Ok(())
    }
}
