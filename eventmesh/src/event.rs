//! Application events and their runtime type descriptors.
//!
//! An [`Event`] is a plain serde struct. Registering it produces an
//! [`EventType`], a copyable descriptor carrying the type's identity, its wire
//! display name and a JSON decoder, so inbound messages can be turned back
//! into concrete events without reflection.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Identity and timing stamped on every event.
///
/// Embed it with `#[serde(flatten)]` so the body carries `eventId` and
/// `occurredOnUtc` next to the event's own fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    pub event_id: Uuid,
    pub occurred_on_utc: DateTime<Utc>,
}

impl EventMeta {
    /// Fresh time-ordered id, occurred now
    pub fn new() -> Self {
        Self {
            event_id: Uuid::now_v7(),
            occurred_on_utc: Utc::now(),
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// An application event that can travel over the broker.
///
/// Bodies are JSON; use `#[serde(rename_all = "camelCase")]` on implementors
/// to keep field naming stable on the wire.
pub trait Event: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Name written to the `type` property and used to resolve inbound
    /// messages. Defaults to the bare type name.
    fn name() -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }

    fn meta(&self) -> EventMeta;
}

/// Object-safe view of an [`Event`], used wherever the concrete type is only
/// known at runtime.
pub trait AnyEvent: fmt::Debug + Send + Sync + 'static {
    fn event_type(&self) -> EventType;

    fn event_meta(&self) -> EventMeta;

    fn to_json(&self) -> serde_json::Result<Vec<u8>>;

    fn as_any(&self) -> &dyn Any;
}

impl<E: Event> AnyEvent for E {
    fn event_type(&self) -> EventType {
        EventType::of::<E>()
    }

    fn event_meta(&self) -> EventMeta {
        self.meta()
    }

    fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn AnyEvent {
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    pub fn is<E: Event>(&self) -> bool {
        self.as_any().is::<E>()
    }
}

type DecodeFn = fn(&[u8]) -> serde_json::Result<Box<dyn AnyEvent>>;

/// Runtime descriptor of a registered event type.
///
/// Equality and hashing use the Rust `TypeId` only, so two descriptors of the
/// same type always compare equal.
#[derive(Clone, Copy)]
pub struct EventType {
    id: TypeId,
    name: &'static str,
    full_name: &'static str,
    decode: DecodeFn,
}

impl EventType {
    pub fn of<E: Event>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: E::name(),
            full_name: std::any::type_name::<E>(),
            decode: decode_json::<E>,
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Wire display name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fully qualified Rust path
    pub fn full_name(&self) -> &'static str {
        self.full_name
    }

    /// Module path the type lives in, without the type itself
    pub fn namespace(&self) -> &'static str {
        let path = strip_generics(self.full_name);
        match path.rfind("::") {
            Some(idx) => &path[..idx],
            None => "Unknown",
        }
    }

    /// Crate that defines the type
    pub fn crate_name(&self) -> &'static str {
        let path = strip_generics(self.full_name);
        match path.find("::") {
            Some(idx) => &path[..idx],
            None => "Unknown",
        }
    }

    pub fn is<E: Event>(&self) -> bool {
        self.id == TypeId::of::<E>()
    }

    /// Decode a JSON body into this event type
    pub fn decode(&self, body: &[u8]) -> serde_json::Result<Box<dyn AnyEvent>> {
        (self.decode)(body)
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventType {}

impl Hash for EventType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventType")
            .field("name", &self.name)
            .field("full_name", &self.full_name)
            .finish()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn decode_json<E: Event>(body: &[u8]) -> serde_json::Result<Box<dyn AnyEvent>> {
    let event: E = serde_json::from_slice(body)?;
    Ok(Box::new(event))
}

fn strip_generics(path: &str) -> &str {
    match path.find('<') {
        Some(idx) => &path[..idx],
        None => path,
    }
}

fn short_type_name(path: &'static str) -> &'static str {
    let path = strip_generics(path);
    path.rsplit("::").next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct OrderCreatedEvent {
        #[serde(flatten)]
        meta: EventMeta,
        order_id: u64,
        customer_name: String,
    }

    impl Event for OrderCreatedEvent {
        fn meta(&self) -> EventMeta {
            self.meta
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Renamed {
        #[serde(flatten)]
        meta: EventMeta,
    }

    impl Event for Renamed {
        fn name() -> &'static str {
            "orders.renamed.v2"
        }

        fn meta(&self) -> EventMeta {
            self.meta
        }
    }

    #[test]
    fn test_default_name_is_bare_type_name() {
        let event_type = EventType::of::<OrderCreatedEvent>();
        assert_eq!(event_type.name(), "OrderCreatedEvent");
        assert!(event_type.full_name().ends_with("event::tests::OrderCreatedEvent"));
        assert_eq!(event_type.crate_name(), "eventmesh");
        assert_eq!(event_type.namespace(), "eventmesh::event::tests");
    }

    #[test]
    fn test_custom_name() {
        assert_eq!(EventType::of::<Renamed>().name(), "orders.renamed.v2");
    }

    #[test]
    fn test_identity_is_type_id() {
        assert_eq!(EventType::of::<Renamed>(), EventType::of::<Renamed>());
        assert_ne!(EventType::of::<Renamed>(), EventType::of::<OrderCreatedEvent>());
        assert!(EventType::of::<Renamed>().is::<Renamed>());
    }

    #[test]
    fn test_body_uses_camel_case() {
        let event = OrderCreatedEvent {
            meta: EventMeta::new(),
            order_id: 7,
            customer_name: "Ada".into(),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&AnyEvent::to_json(&event).unwrap()).unwrap();
        assert_eq!(json["orderId"], 7);
        assert_eq!(json["customerName"], "Ada");
        assert_eq!(json["eventId"], event.meta.event_id.to_string());
        assert!(json.get("occurredOnUtc").is_some());
    }

    #[test]
    fn test_decode_and_downcast() {
        let event = OrderCreatedEvent {
            meta: EventMeta::new(),
            order_id: 42,
            customer_name: "Grace".into(),
        };
        let body = serde_json::to_vec(&event).unwrap();

        let decoded = EventType::of::<OrderCreatedEvent>().decode(&body).unwrap();
        assert!(decoded.is::<OrderCreatedEvent>());
        assert_eq!(decoded.event_meta(), event.meta);
        let concrete = decoded.downcast_ref::<OrderCreatedEvent>().unwrap();
        assert_eq!(concrete.order_id, 42);
        assert!(decoded.downcast_ref::<Renamed>().is_none());
    }

    #[test]
    fn test_decode_rejects_mismatched_body() {
        let result = EventType::of::<OrderCreatedEvent>().decode(b"null");
        assert!(result.is_err());
        let result = EventType::of::<OrderCreatedEvent>().decode(b"{\"orderId\": \"x\"}");
        assert!(result.is_err());
    }
}
