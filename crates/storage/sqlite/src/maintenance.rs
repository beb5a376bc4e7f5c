//! Periodic housekeeping
//!
//! - deletes completed idempotency records whose ttl elapsed
//! - purges delivered outbox events older than the retention window
//! - refreshes the DLQ depth gauge
//!
//! In-flight reservations and undelivered events are never touched.

use chrono::Utc;
use memoria_shared::config::OutboxConfig;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::idempotency::IdempotencyStore;
use crate::outbox::{DeadLetterQueue, OutboxStore};
use crate::pool::ConnectionPool;

/// Configuration for [`MaintenanceTask`]
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between cycles
    pub tick_interval: Duration,

    /// Delivered events older than this are purged
    pub outbox_retention: Duration,

    pub enabled: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            outbox_retention: Duration::from_secs(7 * 24 * 3600),
            enabled: true,
        }
    }
}

impl MaintenanceConfig {
    pub fn from_outbox(outbox: &OutboxConfig) -> Self {
        Self::default().with_outbox_retention(Duration::from_secs(
            u64::from(outbox.retention_days) * 24 * 3600,
        ))
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_outbox_retention(mut self, retention: Duration) -> Self {
        self.outbox_retention = retention;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Result of one maintenance cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceResult {
    pub idempotency_swept: u64,
    pub outbox_purged: u64,
    pub dlq_depth: Option<u64>,
    pub execution_time_ms: u64,
    pub errors: Vec<String>,
}

impl MaintenanceResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Maintenance: {} idempotency records swept, {} outbox events purged, {}ms",
            self.idempotency_swept, self.outbox_purged, self.execution_time_ms
        )
    }
}

#[derive(Debug, Default)]
struct MaintenanceCounters {
    cycles: AtomicU64,
    idempotency_swept: AtomicU64,
    outbox_purged: AtomicU64,
    errors: AtomicU64,
}

/// Cumulative counters of a [`MaintenanceTask`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceMetrics {
    pub cycles: u64,
    pub idempotency_swept: u64,
    pub outbox_purged: u64,
    pub errors: u64,
}

pub struct MaintenanceTask {
    config: MaintenanceConfig,
    pool: ConnectionPool,
    idempotency: Arc<IdempotencyStore>,
    outbox: OutboxStore,
    dlq: DeadLetterQueue,
    counters: MaintenanceCounters,
    shutdown: broadcast::Sender<()>,
    stopping: AtomicBool,
}

impl MaintenanceTask {
    pub fn new(
        config: MaintenanceConfig,
        pool: ConnectionPool,
        idempotency: Arc<IdempotencyStore>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            outbox: OutboxStore::new(pool.clone()),
            dlq: DeadLetterQueue::new(pool.clone()),
            config,
            pool,
            idempotency,
            counters: MaintenanceCounters::default(),
            shutdown,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> MaintenanceMetrics {
        MaintenanceMetrics {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            idempotency_swept: self.counters.idempotency_swept.load(Ordering::Relaxed),
            outbox_purged: self.counters.outbox_purged.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Run cycles on the configured interval until shutdown.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Maintenance task is disabled");
            return;
        }

        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            outbox_retention_secs = self.config.outbox_retention.as_secs(),
            "Maintenance task started"
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown.subscribe();

        while !self.stopping.load(Ordering::Acquire) {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let result = self.run_cycle().await;
                    for e in &result.errors {
                        error!(error = %e, "Maintenance step failed");
                    }
                    if result.idempotency_swept > 0 || result.outbox_purged > 0 {
                        info!("{}", result.summary());
                    } else {
                        debug!("{}", result.summary());
                    }
                }
            }
        }
        info!("Maintenance task stopped");
    }

    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        let _ = self.shutdown.send(());
    }

    /// One sweep of every housekeeping step. Steps fail independently.
    pub async fn run_cycle(&self) -> MaintenanceResult {
        let started = std::time::Instant::now();
        let now = Utc::now();
        let mut result = MaintenanceResult::default();

        match self.pool.acquire().await {
            Ok(mut conn) => {
                match self.idempotency.sweep_expired(&mut conn, now).await {
                    Ok(n) => result.idempotency_swept = n,
                    Err(e) => {
                        if e.is_connection_fault() {
                            conn.mark_broken();
                        }
                        result.errors.push(format!("idempotency sweep: {}", e));
                    }
                }
                conn.release().await;
            }
            Err(e) => result.errors.push(format!("idempotency sweep: {}", e)),
        }

        let retention = chrono::Duration::from_std(self.config.outbox_retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = now.checked_sub_signed(retention).unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        match self.outbox.purge_delivered(cutoff).await {
            Ok(n) => result.outbox_purged = n,
            Err(e) => result.errors.push(format!("outbox purge: {}", e)),
        }

        match self.dlq.count().await {
            Ok(depth) => result.dlq_depth = Some(depth),
            Err(e) => result.errors.push(format!("dlq depth: {}", e)),
        }

        result.execution_time_ms = started.elapsed().as_millis() as u64;

        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        self.counters
            .idempotency_swept
            .fetch_add(result.idempotency_swept, Ordering::Relaxed);
        self.counters
            .outbox_purged
            .fetch_add(result.outbox_purged, Ordering::Relaxed);
        self.counters
            .errors
            .fetch_add(result.errors.len() as u64, Ordering::Relaxed);
        result
    }
}

impl std::fmt::Debug for MaintenanceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceTask")
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_outbox_retention() {
        let outbox = OutboxConfig {
            retention_days: 2,
            ..OutboxConfig::default()
        };
        let config = MaintenanceConfig::from_outbox(&outbox)
            .with_tick_interval(Duration::from_secs(5));

        assert_eq!(config.outbox_retention, Duration::from_secs(2 * 24 * 3600));
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert!(config.enabled);
        assert!(!config.disabled().enabled);
    }

    #[test]
    fn test_result_summary() {
        let result = MaintenanceResult {
            idempotency_swept: 3,
            outbox_purged: 10,
            execution_time_ms: 4,
            ..Default::default()
        };
        assert!(!result.has_errors());
        assert_eq!(
            result.summary(),
            "Maintenance: 3 idempotency records swept, 10 outbox events purged, 4ms"
        );
    }
}
