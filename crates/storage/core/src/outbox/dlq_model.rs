//! Dead Letter Queue (DLQ) Model for Outbox Events
//!
//! Events that exhausted their retries, or failed in a way retries cannot
//! fix, are copied here with a structured reason. DLQ rows are never
//! mutated; a replay creates a fresh outbox event and an audit record.

use chrono::{DateTime, Utc};
use memoria_shared::{DlqEntryId, EventId, UnitOfWorkId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::model::{NewOutboxEvent, OutboxEvent};

/// Why an event was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    MaxRetriesExceeded,
    SchemaValidationFailed,
    PoisonMessage,
    ProcessingTimeout,
    PermanentFailure,
}

impl DlqReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqReason::MaxRetriesExceeded => "max_retries_exceeded",
            DlqReason::SchemaValidationFailed => "schema_validation_failed",
            DlqReason::PoisonMessage => "poison_message",
            DlqReason::ProcessingTimeout => "processing_timeout",
            DlqReason::PermanentFailure => "permanent_failure",
        }
    }
}

impl fmt::Display for DlqReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DlqReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_retries_exceeded" => Ok(DlqReason::MaxRetriesExceeded),
            "schema_validation_failed" => Ok(DlqReason::SchemaValidationFailed),
            "poison_message" => Ok(DlqReason::PoisonMessage),
            "processing_timeout" => Ok(DlqReason::ProcessingTimeout),
            "permanent_failure" => Ok(DlqReason::PermanentFailure),
            _ => Err(format!("Invalid DlqReason: {}", s)),
        }
    }
}

/// A dead-lettered event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: DlqEntryId,

    /// The outbox event this entry was copied from
    pub original_event_id: EventId,

    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub event_metadata: Option<serde_json::Value>,
    pub target_topic: String,
    pub partition_key: String,
    pub sequence_number: i64,

    pub reason: DlqReason,
    pub error_message: String,
    pub delivery_attempts: u32,

    /// Worker that made the final attempt
    pub worker_id: Option<String>,

    pub original_created_at: DateTime<Utc>,
    pub moved_at: DateTime<Utc>,
}

impl DlqEntry {
    /// Build a DLQ entry from the event's state at the moment it failed.
    pub fn from_outbox_event(
        event: &OutboxEvent,
        reason: DlqReason,
        error_message: impl Into<String>,
        worker_id: Option<String>,
        moved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DlqEntryId::new(),
            original_event_id: event.id,
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            event_metadata: event.event_metadata.clone(),
            target_topic: event.target_topic.clone(),
            partition_key: event.partition_key.clone(),
            sequence_number: event.sequence_number,
            reason,
            error_message: error_message.into(),
            delivery_attempts: event.delivery_attempts,
            worker_id,
            original_created_at: event.created_at,
            moved_at,
        }
    }

    /// A new outbox event carrying this entry's content, tagged with its origin.
    pub fn to_replay_event(&self) -> NewOutboxEvent {
        let mut metadata = match &self.event_metadata {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        metadata.insert(
            "replayed_from_dlq".to_string(),
            serde_json::Value::String(self.id.to_string()),
        );
        metadata.insert(
            "original_event_id".to_string(),
            serde_json::Value::String(self.original_event_id.to_string()),
        );

        NewOutboxEvent::new(
            self.aggregate_type.clone(),
            self.aggregate_id.clone(),
            self.event_type.clone(),
            self.payload.clone(),
        )
        .with_metadata(serde_json::Value::Object(metadata))
        .with_topic(self.target_topic.clone())
        .with_partition_key(self.partition_key.clone())
    }
}

/// Audit record of a DLQ replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqReplay {
    pub dlq_entry_id: DlqEntryId,
    pub new_event_id: EventId,
    pub unit_of_work_id: UnitOfWorkId,
    pub requested_by: String,
    pub replayed_at: DateTime<Utc>,
}
