//! Outbox Event Model
//!
//! Domain model for events written by a committing unit of work and drained
//! by the outbox worker.

use chrono::{DateTime, Utc};
use memoria_shared::{EventId, UnitOfWorkId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::backoff::RetryPolicy;

/// Delivery status of an outbox event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Committed, waiting for its first delivery
    Pending,
    /// Leased by a worker
    Processing,
    /// Published successfully (terminal)
    Delivered,
    /// Last delivery failed; retried at `next_retry_at`
    Failed,
    /// Moved to the dead-letter queue (terminal)
    Dlq,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Processing => "processing",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Dlq => "dlq",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Dlq)
    }

    /// Valid transitions:
    /// - Pending, Failed → Processing (lease)
    /// - Processing → Delivered, Failed, Dlq
    /// - Processing → Pending, Failed (lease released without an attempt)
    /// - Processing → Processing (expired lease taken over)
    pub fn can_transition_to(&self, next: &DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Failed, Processing)
                | (Processing, Delivered)
                | (Processing, Failed)
                | (Processing, Dlq)
                | (Processing, Pending)
                | (Processing, Processing)
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "processing" => Ok(DeliveryStatus::Processing),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            "dlq" => Ok(DeliveryStatus::Dlq),
            _ => Err(format!("Invalid DeliveryStatus: {}", s)),
        }
    }
}

/// An event staged on a unit of work. Not durable until the unit commits.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub target_topic: Option<String>,
    pub partition_key: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            metadata: None,
            target_topic: None,
            partition_key: None,
            retry_policy: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.target_topic = Some(topic.into());
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        let mut metadata = match self.metadata.take() {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        metadata.insert(
            "correlation_id".to_string(),
            serde_json::Value::String(correlation_id.into()),
        );
        self.metadata = Some(serde_json::Value::Object(metadata));
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Topic the event is published to; defaults to `memoria.<aggregate_type>`.
    pub fn resolved_topic(&self) -> String {
        self.target_topic
            .clone()
            .unwrap_or_else(|| format!("memoria.{}", self.aggregate_type.to_lowercase()))
    }

    /// Partition key; defaults to the aggregate id so one aggregate stays on one partition.
    pub fn resolved_partition_key(&self) -> String {
        self.partition_key
            .clone()
            .unwrap_or_else(|| self.aggregate_id.clone())
    }
}

/// A persisted outbox event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub unit_of_work_id: Option<UnitOfWorkId>,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub event_metadata: Option<serde_json::Value>,
    pub sequence_number: i64,
    pub created_at: DateTime<Utc>,
    pub delivery_attempts: u32,
    pub delivery_status: DeliveryStatus,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub target_topic: String,
    pub partition_key: String,
    pub retry_policy: RetryPolicy,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Correlation id carried in the event metadata, if any.
    pub fn correlation_id(&self) -> Option<String> {
        self.event_metadata
            .as_ref()
            .and_then(|m| m.get("correlation_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Whether a worker may lease this event at `now`.
    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        match self.delivery_status {
            DeliveryStatus::Pending | DeliveryStatus::Failed => self.next_retry_at <= now,
            DeliveryStatus::Processing => self.lease_expires_at.map_or(true, |at| at <= now),
            DeliveryStatus::Delivered | DeliveryStatus::Dlq => false,
        }
    }
}

/// Event counts by delivery status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub processing: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dlq: u64,
}

impl OutboxStats {
    /// Events not yet in a terminal state.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.processing + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(status: DeliveryStatus) -> OutboxEvent {
        let now = Utc::now();
        OutboxEvent {
            id: EventId::new(),
            unit_of_work_id: None,
            aggregate_id: "memory-123".into(),
            aggregate_type: "Memory".into(),
            event_type: "MEMORY_CREATED".into(),
            payload: json!({"title": "first steps"}),
            event_metadata: Some(json!({"correlation_id": "req-9"})),
            sequence_number: 1,
            created_at: now,
            delivery_attempts: 0,
            delivery_status: status,
            first_attempt_at: None,
            last_attempt_at: None,
            next_retry_at: now,
            delivered_at: None,
            target_topic: "memoria.memory".into(),
            partition_key: "memory-123".into(),
            retry_policy: RetryPolicy::default(),
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
        }
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Processing,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
            DeliveryStatus::Dlq,
        ] {
            assert_eq!(status.as_str().parse::<DeliveryStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_terminal_statuses_do_not_transition() {
        assert!(!DeliveryStatus::Delivered.can_transition_to(&DeliveryStatus::Processing));
        assert!(!DeliveryStatus::Dlq.can_transition_to(&DeliveryStatus::Pending));
        assert!(DeliveryStatus::Failed.can_transition_to(&DeliveryStatus::Processing));
        assert!(!DeliveryStatus::Pending.can_transition_to(&DeliveryStatus::Delivered));
    }

    #[test]
    fn test_defaults_for_topic_and_partition() {
        let e = NewOutboxEvent::new("Memory", "memory-123", "MEMORY_CREATED", json!({}));
        assert_eq!(e.resolved_topic(), "memoria.memory");
        assert_eq!(e.resolved_partition_key(), "memory-123");

        let e = e.with_topic("family.timeline").with_partition_key("family-7");
        assert_eq!(e.resolved_topic(), "family.timeline");
        assert_eq!(e.resolved_partition_key(), "family-7");
    }

    #[test]
    fn test_correlation_id_merges_into_metadata() {
        let e = NewOutboxEvent::new("Memory", "m-1", "MEMORY_CREATED", json!({}))
            .with_metadata(json!({"source": "import"}))
            .with_correlation_id("req-42");
        let metadata = e.metadata.unwrap();
        assert_eq!(metadata["source"], "import");
        assert_eq!(metadata["correlation_id"], "req-42");
    }

    #[test]
    fn test_leasability() {
        let now = Utc::now();
        assert!(event(DeliveryStatus::Pending).is_leasable(now));
        assert!(!event(DeliveryStatus::Delivered).is_leasable(now));

        let mut failed = event(DeliveryStatus::Failed);
        failed.next_retry_at = now + chrono::Duration::seconds(5);
        assert!(!failed.is_leasable(now));

        let mut leased = event(DeliveryStatus::Processing);
        leased.lease_expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(!leased.is_leasable(now));
        leased.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(leased.is_leasable(now));

        assert_eq!(event(DeliveryStatus::Pending).correlation_id().as_deref(), Some("req-9"));
    }
}
