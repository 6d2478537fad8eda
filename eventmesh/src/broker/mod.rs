//! Transport seam between the messaging pipelines and the AMQP broker.
//!
//! The pipelines only talk to [`BrokerConnector`], [`BrokerConnection`] and
//! [`BrokerChannel`]. [`amqp`] implements them on top of `lapin`; [`memory`]
//! is an in-process broker for tests and local development.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::message::MessageProperties;
use crate::topology::{ExchangeSpec, QueueSpec};

pub mod amqp;
pub mod memory;

pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

/// What a shared or ad-hoc connection is used for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Publisher,
    Consumer,
    /// Single-use connection owned by its caller, e.g. provisioning at startup
    Dedicated(String),
}

impl ConnectionRole {
    pub fn label(&self) -> &str {
        match self {
            ConnectionRole::Publisher => "Publisher",
            ConnectionRole::Consumer => "Consumer",
            ConnectionRole::Dedicated(label) => label,
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything needed to open one broker connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    pub url: String,
    /// Client-provided name shown in the broker's management UI
    pub connection_name: String,
    pub heartbeat_seconds: u16,
    pub connection_timeout_ms: u64,
    pub channel_max: u16,
}

/// Result of a queue declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message handed to a consumer callback
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Invoked once per delivery. The returned future is driven on its own task.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked with the consumer tag once the subscription's delivery stream has
/// ended, whether the client cancelled it or the broker dropped it
pub type SubscriptionEndedCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Whether the broker has blocked publishing on this connection (resource alarm)
    fn is_blocked(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

/// The AMQP channel operations the pipelines rely on
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, exchange: &ExchangeSpec) -> Result<()>;

    async fn queue_declare(&self, queue: &QueueSpec) -> Result<QueueInfo>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<()>;

    /// Start consuming `queue`, returning the consumer tag the broker confirmed
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        on_delivery: DeliveryCallback,
        on_ended: SubscriptionEndedCallback,
    ) -> Result<String>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
