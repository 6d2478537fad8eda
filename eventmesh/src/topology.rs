//! Declarative broker topology: exchanges, queues and the event routing map.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MessagingError, Result};
use crate::event::{Event, EventType};
use crate::message::{headers, FieldTable, FieldValue};

/// Where an event type is published
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventRouting {
    pub exchange_name: String,
    pub routing_key: String,
}

impl EventRouting {
    pub fn new(exchange_name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for EventRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange_name, self.routing_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    #[default]
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// Exchange declaration. Identity is the name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: FieldTable,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
            arguments: FieldTable::new(),
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Topic)
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Direct)
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Fanout)
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

/// Queue declaration, optionally bound to an exchange. Identity is the name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    #[serde(default)]
    pub exchange_name: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: FieldTable,
    #[serde(default)]
    pub prefetch_count: Option<u16>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exchange_name: String::new(),
            routing_key: String::new(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: FieldTable::new(),
            prefetch_count: None,
        }
    }

    pub fn bind(mut self, exchange_name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange_name = exchange_name.into();
        self.routing_key = routing_key.into();
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    /// Route rejected and expired messages to `exchange` with `routing_key`
    pub fn with_dead_letter(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.arguments
            .insert(headers::DEAD_LETTER_EXCHANGE.into(), FieldValue::String(exchange.into()));
        self.arguments.insert(
            headers::DEAD_LETTER_ROUTING_KEY.into(),
            FieldValue::String(routing_key.into()),
        );
        self
    }

    pub fn with_message_ttl(mut self, ttl_ms: i64) -> Self {
        self.arguments
            .insert(headers::MESSAGE_TTL.into(), FieldValue::Int(ttl_ms));
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.arguments
            .insert(headers::MAX_RETRIES.into(), FieldValue::Int(max_retries));
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// `(exchange, routing_key)` when the queue is bound
    pub fn binding(&self) -> Option<(&str, &str)> {
        if self.exchange_name.is_empty() || self.routing_key.is_empty() {
            return None;
        }
        Some((self.exchange_name.as_str(), self.routing_key.as_str()))
    }

    /// Memo key of this queue's binding
    pub fn binding_key(&self) -> Option<String> {
        self.binding()
            .map(|(exchange, key)| format!("{}->{}|{}", self.name, exchange, key))
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.arguments
            .get(headers::DEAD_LETTER_EXCHANGE)
            .and_then(FieldValue::as_str)
    }

    pub fn dead_letter_routing_key(&self) -> Option<&str> {
        self.arguments
            .get(headers::DEAD_LETTER_ROUTING_KEY)
            .and_then(FieldValue::as_str)
    }
}

/// The complete, immutable topology of a process
#[derive(Debug, Clone, Default)]
pub struct Topology {
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    routes: Vec<(EventType, EventRouting)>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::new()
    }

    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    pub fn routes(&self) -> &[(EventType, EventRouting)] {
        &self.routes
    }

    /// Case-insensitive queue lookup
    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues
            .iter()
            .find(|queue| queue.name.eq_ignore_ascii_case(name))
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeSpec> {
        self.exchanges
            .iter()
            .find(|exchange| exchange.name.eq_ignore_ascii_case(name))
    }
}

/// Assembles a [`Topology`].
///
/// Exchanges and queues are replaced when added again under the same name
/// (compared case-insensitively); mapping an event type twice keeps the last
/// routing. Validation errors are reported by [`TopologyBuilder::build`].
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    topology: Topology,
    errors: Vec<String>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_exchange(mut self, exchange: ExchangeSpec) -> Self {
        if exchange.name.trim().is_empty() {
            self.errors.push("exchange name must not be blank".to_string());
            return self;
        }
        self.topology
            .exchanges
            .retain(|existing| !existing.name.eq_ignore_ascii_case(&exchange.name));
        self.topology.exchanges.push(exchange);
        self
    }

    pub fn add_queue(mut self, queue: QueueSpec) -> Self {
        if queue.name.trim().is_empty() {
            self.errors.push("queue name must not be blank".to_string());
            return self;
        }
        self.topology
            .queues
            .retain(|existing| !existing.name.eq_ignore_ascii_case(&queue.name));
        self.topology.queues.push(queue);
        self
    }

    pub fn map_event<E: Event>(self, exchange_name: &str, routing_key: &str) -> Self {
        self.map_event_type(EventType::of::<E>(), exchange_name, routing_key)
    }

    pub fn map_event_type(mut self, event_type: EventType, exchange_name: &str, routing_key: &str) -> Self {
        if exchange_name.trim().is_empty() {
            self.errors.push(format!(
                "exchange name for event '{}' must not be blank",
                event_type.full_name()
            ));
            return self;
        }
        if routing_key.trim().is_empty() {
            self.errors.push(format!(
                "routing key for event '{}' must not be blank",
                event_type.full_name()
            ));
            return self;
        }

        let routing = EventRouting::new(exchange_name, routing_key);
        match self
            .topology
            .routes
            .iter()
            .position(|(existing, _)| *existing == event_type)
        {
            Some(idx) => self.topology.routes[idx].1 = routing,
            None => self.topology.routes.push((event_type, routing)),
        }
        self
    }

    /// Add every exchange and queue of `defaults` whose name is not configured yet,
    /// and every event mapping for a type that is not mapped yet.
    pub fn merge_defaults(mut self, defaults: &Topology) -> Self {
        for exchange in &defaults.exchanges {
            if self.topology.exchange(&exchange.name).is_none() {
                self.topology.exchanges.push(exchange.clone());
            }
        }
        for queue in &defaults.queues {
            if self.topology.queue(&queue.name).is_none() {
                self.topology.queues.push(queue.clone());
            }
        }
        for (event_type, routing) in &defaults.routes {
            if !self.topology.routes.iter().any(|(existing, _)| existing == event_type) {
                self.topology.routes.push((*event_type, routing.clone()));
            }
        }
        self
    }

    pub fn build(self) -> Result<Topology> {
        if !self.errors.is_empty() {
            return Err(MessagingError::config_error(self.errors.join("; ")));
        }
        Ok(self.topology)
    }
}
