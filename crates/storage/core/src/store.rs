//! Store capability and registry.
//!
//! Domain stores (episodic, semantic, vector, ...) implement [`Store`] and are
//! registered once in a [`StoreRegistry`]. A unit of work refers to them by
//! [`StoreHandle`] and lends each one the transaction's connection only for
//! the duration of a single [`Store::participate`] call.

use async_trait::async_trait;
use memoria_shared::UnitOfWorkId;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, StorageError};

/// Borrowed view of the committing transaction handed to a store.
///
/// The connection borrow is tied to the call, so a store cannot keep it.
pub struct ParticipationContext<'a> {
    unit_of_work_id: UnitOfWorkId,
    connection: &'a mut SqliteConnection,
}

impl<'a> ParticipationContext<'a> {
    pub fn new(unit_of_work_id: UnitOfWorkId, connection: &'a mut SqliteConnection) -> Self {
        Self {
            unit_of_work_id,
            connection,
        }
    }

    pub fn unit_of_work_id(&self) -> UnitOfWorkId {
        self.unit_of_work_id
    }

    /// Connection with the open transaction.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut *self.connection
    }
}

/// What a store wrote during a commit. Folded into the receipt's payload hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreContribution {
    pub store: String,
    pub rows_written: u64,
    /// Store-defined digest of the written content (hex).
    pub digest: Option<String>,
}

impl StoreContribution {
    pub fn new(store: impl Into<String>, rows_written: u64) -> Self {
        Self {
            store: store.into(),
            rows_written,
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }
}

/// A logical store that participates in unit-of-work commits.
#[async_trait]
pub trait Store: Send + Sync {
    /// Stable name, unique within a registry.
    fn name(&self) -> &str;

    /// Apply this unit's pending writes on the shared transaction.
    async fn participate(&self, ctx: &mut ParticipationContext<'_>) -> Result<StoreContribution>;

    /// Called after the transaction committed.
    async fn on_commit(&self, _unit_of_work_id: UnitOfWorkId) {}

    /// Called after the transaction rolled back.
    async fn on_rollback(&self, _unit_of_work_id: UnitOfWorkId) {}
}

/// Index of a store inside its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreHandle(usize);

impl StoreHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store#{}", self.0)
    }
}

/// Explicit catalog of the stores a unit-of-work factory can coordinate.
#[derive(Default)]
pub struct StoreRegistry {
    stores: Vec<Arc<dyn Store>>,
    by_name: HashMap<String, StoreHandle>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store. Names must be unique.
    pub fn register(&mut self, store: Arc<dyn Store>) -> Result<StoreHandle> {
        let name = store.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(StorageError::store(name, "store already registered"));
        }

        let handle = StoreHandle(self.stores.len());
        self.stores.push(store);
        self.by_name.insert(name, handle);
        Ok(handle)
    }

    pub fn get(&self, handle: StoreHandle) -> Option<&Arc<dyn Store>> {
        self.stores.get(handle.0)
    }

    pub fn resolve(&self, handle: StoreHandle) -> Result<Arc<dyn Store>> {
        self.get(handle)
            .cloned()
            .ok_or_else(|| StorageError::UnknownStore(handle.to_string()))
    }

    pub fn handle_of(&self, name: &str) -> Option<StoreHandle> {
        self.by_name.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.iter().map(|s| s.name())
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("stores", &self.names().collect::<Vec<_>>())
            .finish()
    }
}
