//! Bounded SQLite connection pool
//!
//! Every unit of work, outbox worker and migration run checks out its
//! connection here. Capacity is enforced by a semaphore with `N` permits:
//! a caller that cannot obtain a permit within the acquire timeout receives
//! [`StorageError::PoolExhausted`], the pool never opens more than `N`
//! connections.
//!
//! # Lifecycle
//!
//! - Connections are opened lazily, up to capacity
//!
//! - [`PooledConnection::release`] health-checks the connection and returns
//!   it to the idle list, or retires it when the check fails
//!
//! - A guard dropped without `release`, or marked broken, is retired; its
//!   permit is returned so capacity is restored
//!
//! # Usage
//!
//! ```ignore
//! let pool = ConnectionPool::connect(PoolConfig::from(&config.database), metrics).await?;
//! let mut conn = pool.acquire().await?;
//! sqlx::query("SELECT 1").execute(&mut *conn).await?;
//! conn.release().await;
//! ```

use chrono::{DateTime, Utc};
use memoria_shared::config::DatabaseConfig;
use memoria_storage_core::{Result, StorageError};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::metrics::StorageMetrics;

const RELEASED_MSG: &str = "PooledConnection used after release";

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// SQLite connection string (`sqlite:path/to/file.db`)
    pub url: String,
    /// Maximum number of simultaneously leased connections
    pub max_connections: u32,
    /// Default wait for a free connection
    pub acquire_timeout: Duration,
    /// How long SQLite waits on a locked database before reporting `SQLITE_BUSY`
    pub busy_timeout: Duration,
    /// Run `SELECT 1` before returning a connection to the idle list
    pub health_check_on_release: bool,
}

impl PoolConfig {
    pub fn new(url: impl Into<String>, max_connections: u32) -> Self {
        Self {
            url: url.into(),
            max_connections,
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
            health_check_on_release: true,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

impl From<&DatabaseConfig> for PoolConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            url: config.url.clone(),
            max_connections: config.max_connections,
            acquire_timeout: config.acquire_timeout(),
            busy_timeout: config.busy_timeout(),
            health_check_on_release: config.health_check_on_release,
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections (idle + leased)
    pub size: u32,
    /// Idle connections ready for reuse
    pub available: u32,
    /// Connections currently checked out
    pub leased: u32,
    /// Tasks waiting for a connection
    pub waiting: u32,
    /// Configured maximum
    pub capacity: u32,
}

struct IdleConnection {
    id: u64,
    conn: SqliteConnection,
    last_health_check: Option<DateTime<Utc>>,
}

struct PoolInner {
    config: PoolConfig,
    connect_options: SqliteConnectOptions,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    open: AtomicU32,
    leased: AtomicU32,
    waiting: AtomicU32,
    next_id: AtomicU64,
    closed: AtomicBool,
    metrics: StorageMetrics,
}

impl PoolInner {
    fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.open.load(Ordering::SeqCst),
            available: self.idle.lock().len() as u32,
            leased: self.leased.load(Ordering::SeqCst),
            waiting: self.waiting.load(Ordering::SeqCst),
            capacity: self.config.max_connections,
        }
    }

    fn retire(&self, id: u64, reason: &str) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.metrics.pool_connections_retired.inc();
        warn!(connection_id = id, reason, "Retiring pooled connection");
    }

    fn log_utilization(&self, event: &'static str) {
        let stats = self.stats();
        debug!(
            event,
            leased = stats.leased,
            available = stats.available,
            waiting = stats.waiting,
            capacity = stats.capacity,
            "Pool utilization"
        );
    }
}

/// Decrements the waiting count even when the acquire future is cancelled.
struct WaitingGuard<'a>(&'a PoolInner);

impl<'a> WaitingGuard<'a> {
    fn enter(inner: &'a PoolInner) -> Self {
        inner.waiting.fetch_add(1, Ordering::SeqCst);
        inner.metrics.pool_waiting.inc();
        Self(inner)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
        self.0.metrics.pool_waiting.dec();
    }
}

/// Bounded pool of SQLite connections
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create the pool and open a first connection to validate the URL.
    pub async fn connect(config: PoolConfig, metrics: StorageMetrics) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(StorageError::Database(sqlx::Error::Configuration(
                "max_connections must be greater than zero".into(),
            )));
        }

        info!(
            "Creating SQLite pool (max={}, acquire_timeout={:?}, busy_timeout={:?})",
            config.max_connections, config.acquire_timeout, config.busy_timeout
        );

        let connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout);

        metrics.pool_capacity.set(i64::from(config.max_connections));

        let pool = Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
                config,
                connect_options,
                idle: Mutex::new(VecDeque::new()),
                open: AtomicU32::new(0),
                leased: AtomicU32::new(0),
                waiting: AtomicU32::new(0),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                metrics,
            }),
        };

        let (id, conn) = pool.open_connection().await?;
        pool.inner.idle.lock().push_back(IdleConnection {
            id,
            conn,
            last_health_check: None,
        });

        info!("SQLite pool created successfully");
        Ok(pool)
    }

    /// Check out a connection, waiting up to the configured acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Check out a connection, waiting at most `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(sqlx::Error::PoolClosed.into());
        }

        let started = Instant::now();
        let permit = {
            let _waiting = WaitingGuard::enter(&self.inner);
            tokio::time::timeout(timeout, self.inner.semaphore.clone().acquire_owned()).await
        };

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(sqlx::Error::PoolClosed.into()),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                self.inner.metrics.pool_timeouts.inc();
                warn!(
                    capacity = self.inner.config.max_connections,
                    waited_ms, "Connection pool exhausted"
                );
                return Err(StorageError::PoolExhausted {
                    capacity: self.inner.config.max_connections,
                    waited_ms,
                });
            }
        };

        let reused = self.inner.idle.lock().pop_front();
        let (id, conn, last_health_check) = match reused {
            Some(idle) => (idle.id, idle.conn, idle.last_health_check),
            None => {
                let (id, conn) = self.open_connection().await?;
                (id, conn, None)
            }
        };

        self.inner.leased.fetch_add(1, Ordering::SeqCst);
        self.inner.metrics.pool_leased.inc();
        self.inner.log_utilization("checkout");

        Ok(PooledConnection {
            id,
            conn: Some(conn),
            last_health_check,
            broken: false,
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    pub fn capacity(&self) -> u32 {
        self.inner.config.max_connections
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &StorageMetrics {
        &self.inner.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop handing out connections and close the idle ones.
    ///
    /// Leased connections are closed when their guards come back.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.semaphore.close();

        let drained: Vec<IdleConnection> = self.inner.idle.lock().drain(..).collect();
        for idle in drained {
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = idle.conn.close().await {
                debug!(connection_id = idle.id, error = %e, "Error closing idle connection");
            }
        }
        info!("SQLite pool closed");
    }

    async fn open_connection(&self) -> Result<(u64, SqliteConnection)> {
        let conn = self.inner.connect_options.connect().await?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        self.inner.metrics.pool_connections_opened.inc();
        debug!(connection_id = id, "Opened SQLite connection");
        Ok((id, conn))
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("url", &self.inner.config.url)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A leased connection
///
/// Holds one pool permit for as long as it lives.
pub struct PooledConnection {
    id: u64,
    conn: Option<SqliteConnection>,
    last_health_check: Option<DateTime<Utc>>,
    broken: bool,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.last_health_check
    }

    /// Mark the connection as untrustworthy; it is retired instead of reused.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Return the connection to the pool.
    ///
    /// Broken connections, and connections failing the health check, are
    /// retired. Either way the permit is released.
    pub async fn release(mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        if self.broken || self.pool.closed.load(Ordering::SeqCst) {
            self.pool.retire(self.id, "released broken or after close");
            return;
        }

        if self.pool.config.health_check_on_release {
            if let Err(e) = sqlx::query("SELECT 1").execute(&mut conn).await {
                self.pool.retire(self.id, "health check failed");
                debug!(connection_id = self.id, error = %e, "Health check error");
                return;
            }
            self.last_health_check = Some(Utc::now());
        }

        self.pool.idle.lock().push_back(IdleConnection {
            id: self.id,
            conn,
            last_health_check: self.last_health_check,
        });
        // permit goes back when `self` drops, after the connection is idle
    }
}

impl Deref for PooledConnection {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect(RELEASED_MSG)
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect(RELEASED_MSG)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.pool.retire(self.id, "dropped without release");
        }
        self.pool.leased.fetch_sub(1, Ordering::SeqCst);
        self.pool.metrics.pool_leased.dec();
        drop(self.permit.take());
        self.pool.log_utilization("return");
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("broken", &self.broken)
            .field("last_health_check", &self.last_health_check)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_from_database_config() {
        let db = DatabaseConfig {
            url: "sqlite:/tmp/memoria.db".to_string(),
            max_connections: 7,
            acquire_timeout_ms: 250,
            busy_timeout_ms: 1000,
            health_check_on_release: false,
        };

        let config = PoolConfig::from(&db);
        assert_eq!(config.max_connections, 7);
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
        assert_eq!(config.busy_timeout, Duration::from_secs(1));
        assert!(!config.health_check_on_release);
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("pool.db").display());
        let pool = ConnectionPool::connect(
            PoolConfig::new(url, 2),
            StorageMetrics::detached().unwrap(),
        )
        .await
        .unwrap();

        let conn = pool.acquire().await.unwrap();
        let first_id = conn.id();
        assert_eq!(pool.stats().leased, 1);
        conn.release().await;

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), first_id);
        assert!(again.last_health_check().is_some());
        again.release().await;

        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.capacity, 2);
    }
}
