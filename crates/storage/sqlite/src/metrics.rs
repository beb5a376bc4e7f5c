//! Prometheus metrics for the storage substrate
//!
//! All collectors are registered into a caller-provided [`Registry`] so the
//! embedding service decides how (and whether) they are exported.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Storage substrate metrics
#[derive(Clone)]
pub struct StorageMetrics {
    /// Configured pool capacity
    pub pool_capacity: IntGauge,
    /// Connections currently leased
    pub pool_leased: IntGauge,
    /// Callers waiting in `acquire`
    pub pool_waiting: IntGauge,
    /// `acquire` calls that ended in `PoolExhausted`
    pub pool_timeouts: IntCounter,
    /// Connections opened
    pub pool_connections_opened: IntCounter,
    /// Connections retired after a failed health check or a fault
    pub pool_connections_retired: IntCounter,
    /// Units of work by outcome (committed, rolled_back, failed, conflict, replayed)
    pub units_of_work: IntCounterVec,
    /// Outbox delivery outcomes (delivered, retried, dead_lettered, released)
    pub outbox_events: IntCounterVec,
    /// Dead-lettered events by reason
    pub dead_letters: IntCounterVec,
    /// DLQ entries not yet replayed, as last observed
    pub dlq_depth: IntGauge,
    /// Callers answered from a cached idempotency result
    pub idempotency_replays: IntCounter,
    /// Receipts appended to the ledger
    pub receipts_appended: IntCounter,
    /// Expired idempotency records removed by maintenance
    pub idempotency_evicted: IntCounter,
    /// Migrations applied
    pub migrations_applied: IntCounter,
}

impl StorageMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let pool_capacity = IntGauge::with_opts(component_opts(
            "memoria_pool_capacity",
            "Configured connection pool capacity",
        ))?;
        registry.register(Box::new(pool_capacity.clone()))?;

        let pool_leased = IntGauge::with_opts(component_opts(
            "memoria_pool_leased_connections",
            "Connections currently leased",
        ))?;
        registry.register(Box::new(pool_leased.clone()))?;

        let pool_waiting = IntGauge::with_opts(component_opts(
            "memoria_pool_waiting_callers",
            "Callers waiting for a connection",
        ))?;
        registry.register(Box::new(pool_waiting.clone()))?;

        let pool_timeouts = IntCounter::with_opts(component_opts(
            "memoria_pool_timeouts_total",
            "Acquire calls that timed out",
        ))?;
        registry.register(Box::new(pool_timeouts.clone()))?;

        let pool_connections_opened = IntCounter::with_opts(component_opts(
            "memoria_pool_connections_opened_total",
            "Connections opened by the pool",
        ))?;
        registry.register(Box::new(pool_connections_opened.clone()))?;

        let pool_connections_retired = IntCounter::with_opts(component_opts(
            "memoria_pool_connections_retired_total",
            "Connections retired instead of being reused",
        ))?;
        registry.register(Box::new(pool_connections_retired.clone()))?;

        let units_of_work = IntCounterVec::new(
            component_opts("memoria_units_of_work_total", "Units of work by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(units_of_work.clone()))?;

        let outbox_events = IntCounterVec::new(
            component_opts("memoria_outbox_events_total", "Outbox delivery outcomes"),
            &["outcome"],
        )?;
        registry.register(Box::new(outbox_events.clone()))?;

        let dead_letters = IntCounterVec::new(
            component_opts("memoria_dead_letters_total", "Dead-lettered events by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(dead_letters.clone()))?;

        let dlq_depth = IntGauge::with_opts(component_opts(
            "memoria_dlq_depth",
            "Dead-letter entries awaiting replay",
        ))?;
        registry.register(Box::new(dlq_depth.clone()))?;

        let idempotency_replays = IntCounter::with_opts(component_opts(
            "memoria_idempotency_replays_total",
            "Units of work answered from a cached result",
        ))?;
        registry.register(Box::new(idempotency_replays.clone()))?;

        let receipts_appended = IntCounter::with_opts(component_opts(
            "memoria_receipts_appended_total",
            "Write receipts appended",
        ))?;
        registry.register(Box::new(receipts_appended.clone()))?;

        let idempotency_evicted = IntCounter::with_opts(component_opts(
            "memoria_idempotency_evicted_total",
            "Expired idempotency records evicted",
        ))?;
        registry.register(Box::new(idempotency_evicted.clone()))?;

        let migrations_applied = IntCounter::with_opts(component_opts(
            "memoria_migrations_applied_total",
            "Schema migrations applied",
        ))?;
        registry.register(Box::new(migrations_applied.clone()))?;

        Ok(Self {
            pool_capacity,
            pool_leased,
            pool_waiting,
            pool_timeouts,
            pool_connections_opened,
            pool_connections_retired,
            units_of_work,
            outbox_events,
            dead_letters,
            dlq_depth,
            idempotency_replays,
            receipts_appended,
            idempotency_evicted,
            migrations_applied,
        })
    }

    /// Metrics bound to a private registry, for embedders that do not export them.
    pub fn detached() -> Result<Self, prometheus::Error> {
        Self::register(&Registry::new())
    }

    pub fn record_unit_of_work(&self, outcome: &str) {
        self.units_of_work.with_label_values(&[outcome]).inc();
    }

    pub fn record_outbox(&self, outcome: &str) {
        self.outbox_events.with_label_values(&[outcome]).inc();
    }

    pub fn record_dead_letter(&self, reason: &str) {
        self.dead_letters.with_label_values(&[reason]).inc();
        self.dlq_depth.inc();
        self.record_outbox("dead_lettered");
    }
}

impl std::fmt::Debug for StorageMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageMetrics")
            .field("pool_capacity", &self.pool_capacity.get())
            .field("pool_leased", &self.pool_leased.get())
            .field("receipts_appended", &self.receipts_appended.get())
            .finish()
    }
}

fn component_opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).const_label("component", "storage")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_exposes_families() {
        let registry = Registry::new();
        let metrics = StorageMetrics::register(&registry).unwrap();

        metrics.record_unit_of_work("committed");
        metrics.record_dead_letter("max_retries_exceeded");
        metrics.pool_capacity.set(5);

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"memoria_units_of_work_total".to_string()));
        assert!(names.contains(&"memoria_dead_letters_total".to_string()));
        assert_eq!(
            metrics
                .outbox_events
                .with_label_values(&["dead_lettered"])
                .get(),
            1
        );
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        StorageMetrics::register(&registry).unwrap();
        assert!(StorageMetrics::register(&registry).is_err());
    }
}
