//! Ports between the outbox worker and the outside world: the event
//! transport, payload validation and operator alerting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use super::dlq_model::DlqEntry;
use super::model::OutboxEvent;

/// Headers attached to every published message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportHeaders {
    pub event_type: String,
    pub aggregate_id: String,
    pub correlation_id: Option<String>,
}

/// The publish contract: what the transport receives for one outbox event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub target_topic: String,
    pub partition_key: String,
    pub payload: serde_json::Value,
    pub headers: TransportHeaders,
}

impl TransportMessage {
    pub fn from_event(event: &OutboxEvent) -> Self {
        Self {
            target_topic: event.target_topic.clone(),
            partition_key: event.partition_key.clone(),
            payload: event.payload.clone(),
            headers: TransportHeaders {
                event_type: event.event_type.clone(),
                aggregate_id: event.aggregate_id.clone(),
                correlation_id: event.correlation_id(),
            },
        }
    }
}

/// Publish failure as reported by the transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// May succeed later (broker down, throttled). Retried with backoff.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// Will never succeed (topic missing, authorization). Dead-lettered.
    #[error("permanent transport error: {0}")]
    Permanent(String),

    /// The message itself cannot be processed. Dead-lettered.
    #[error("poison message: {0}")]
    Poison(String),
}

/// Downstream event transport. Delivery acknowledgment is its own concern;
/// the worker only observes success or failure.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn publish(&self, message: &TransportMessage) -> Result<(), TransportError>;
}

/// Validates an event before it is published.
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, event: &OutboxEvent) -> Result<(), String>;
}

/// Requires a JSON object payload and non-empty routing fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonObjectValidator;

impl PayloadValidator for JsonObjectValidator {
    fn validate(&self, event: &OutboxEvent) -> Result<(), String> {
        if event.event_type.trim().is_empty() {
            return Err("event_type is empty".to_string());
        }
        if event.target_topic.trim().is_empty() {
            return Err("target_topic is empty".to_string());
        }
        if !event.payload.is_object() {
            return Err(format!(
                "payload must be a JSON object, got {}",
                json_kind(&event.payload)
            ));
        }
        Ok(())
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Receives operator-visible alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn dead_lettered(&self, entry: &DlqEntry);
}

/// Alerts as `error!` events on the `memoria::alert` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn dead_lettered(&self, entry: &DlqEntry) {
        error!(
            target: "memoria::alert",
            dlq_entry_id = %entry.id,
            event_id = %entry.original_event_id,
            aggregate_id = %entry.aggregate_id,
            event_type = %entry.event_type,
            reason = %entry.reason,
            attempts = entry.delivery_attempts,
            error = %entry.error_message,
            "Outbox event moved to dead-letter queue"
        );
    }
}
