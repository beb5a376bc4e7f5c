//! Transactional outbox domain: event model, retry policy, dead-letter
//! queue model and the transport/validation/alerting ports.

pub mod backoff;
pub mod dlq_model;
pub mod model;
pub mod transport;

pub use backoff::{Jitter, RetryPolicy, DEFAULT_JITTER_FACTOR};
pub use dlq_model::{DlqEntry, DlqReason, DlqReplay};
pub use model::{DeliveryStatus, NewOutboxEvent, OutboxEvent, OutboxStats};
pub use transport::{
    AlertSink, EventTransport, JsonObjectValidator, PayloadValidator, TracingAlertSink,
    TransportError, TransportHeaders, TransportMessage,
};
