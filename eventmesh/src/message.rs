use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::event::AnyEvent;

/// Content type of every published body
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// AMQP delivery mode for messages that survive a broker restart
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;
/// Wire type name used when a delivery carries no `type` property
pub const UNKNOWN_EVENT_TYPE: &str = "Unknown";

/// Header names stamped by the publisher and read by the consumer
pub mod headers {
    pub const EVENT_ID: &str = "EventId";
    pub const EVENT_TYPE: &str = "EventType";
    pub const OCCURRED_ON: &str = "OccurredOn";
    pub const PUBLISHER: &str = "Publisher";
    pub const ASSEMBLY: &str = "Assembly";
    pub const NAMESPACE: &str = "Namespace";
    pub const RETRY_COUNT: &str = "x-retry-count";

    pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
    pub const DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
    pub const MESSAGE_TTL: &str = "x-message-ttl";
    pub const MAX_RETRIES: &str = "x-max-retries";
}

/// A header or argument value.
///
/// Mirrors the subset of AMQP field values this crate reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Void,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// Header and argument table, ordered by key
pub type FieldTable = BTreeMap<String, FieldValue>;

/// Transport-neutral message properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub delivery_mode: Option<u8>,
    /// The AMQP `type` property: the event's display name
    pub kind: Option<String>,
    /// Unix seconds
    pub timestamp: Option<u64>,
    pub message_id: Option<String>,
    pub headers: FieldTable,
}

impl MessageProperties {
    /// Build the publish-side properties for an event.
    pub fn for_event(event: &dyn AnyEvent, publisher: &str) -> Self {
        let event_type = event.event_type();
        let meta = event.event_meta();
        let event_id = meta.event_id.to_string();

        let mut table = FieldTable::new();
        table.insert(headers::EVENT_ID.into(), event_id.clone().into());
        table.insert(headers::EVENT_TYPE.into(), event_type.name().into());
        table.insert(
            headers::OCCURRED_ON.into(),
            meta.occurred_on_utc.to_rfc3339().into(),
        );
        table.insert(headers::PUBLISHER.into(), publisher.into());
        table.insert(headers::ASSEMBLY.into(), event_type.crate_name().into());
        table.insert(headers::NAMESPACE.into(), event_type.namespace().into());

        Self {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            kind: Some(event_type.name().to_string()),
            timestamp: Some(Utc::now().timestamp().max(0) as u64),
            message_id: Some(event_id),
            headers: table,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn get_header(&self, key: &str) -> Option<&FieldValue> {
        self.headers.get(key)
    }
}

/// Per-delivery context handed to the message processor
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message_id: String,
    pub event_type: String,
    pub queue_name: String,
    pub received_at: DateTime<Utc>,
    pub headers: FieldTable,
    pub retry_count: u32,
}

impl MessageContext {
    /// Create the context for a delivery on `queue_name`.
    ///
    /// A missing `message_id` gets a fresh UUID, a missing `type` becomes
    /// [`UNKNOWN_EVENT_TYPE`].
    pub fn from_properties(properties: &MessageProperties, queue_name: impl Into<String>) -> Self {
        Self {
            message_id: message_id_or_new(properties),
            event_type: event_type_or_unknown(properties).to_string(),
            queue_name: queue_name.into(),
            received_at: Utc::now(),
            headers: properties.headers.clone(),
            retry_count: retry_count(&properties.headers),
        }
    }

    pub fn get_header(&self, key: &str) -> Option<&FieldValue> {
        self.headers.get(key)
    }

    pub fn is_retry(&self) -> bool {
        self.retry_count > 0
    }
}

pub(crate) fn message_id_or_new(properties: &MessageProperties) -> String {
    properties
        .message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub(crate) fn event_type_or_unknown(properties: &MessageProperties) -> &str {
    properties.kind.as_deref().unwrap_or(UNKNOWN_EVENT_TYPE)
}

/// Read the `x-retry-count` header.
///
/// Integers are the canonical encoding. A string or byte value is accepted
/// only when it is plain ASCII decimal digits, which is how string headers
/// reach us from other publishers. Every other value, including negatives,
/// counts as absent.
pub fn retry_count(table: &FieldTable) -> u32 {
    match table.get(headers::RETRY_COUNT) {
        Some(FieldValue::Int(value)) => u32::try_from(*value).unwrap_or(0),
        Some(FieldValue::String(value)) => parse_decimal(value.as_bytes()),
        Some(FieldValue::Bytes(value)) => parse_decimal(value),
        _ => 0,
    }
}

fn parse_decimal(bytes: &[u8]) -> u32 {
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return 0;
    }
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| text.parse::<u32>().ok())
        .unwrap_or(0)
}
