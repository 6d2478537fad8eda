//! In-process broker for tests and local development.
//!
//! [`MemoryBroker`] implements the broker traits with RabbitMQ's routing rules
//! for direct, topic and fanout exchanges, consumer callbacks, acknowledgements
//! and dead-lettering of rejected messages. Every operation is counted and the
//! stored state can be inspected, so tests can assert on exactly what reached
//! the broker.
//!
//! Message TTLs and prefetch limits are recorded but not enforced.
//! [`MemoryBroker::disconnect_all`] and [`MemoryBroker::set_blocked`] simulate
//! a broker restart and a resource alarm.
//!
//! ```
//! use eventmesh::broker::{BrokerConnector, ConnectionOptions, MemoryBroker};
//! use eventmesh::message::MessageProperties;
//! use eventmesh::topology::{ExchangeSpec, QueueSpec};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> eventmesh::Result<()> {
//! let broker = MemoryBroker::new();
//! let options = ConnectionOptions {
//!     url: "amqp://localhost:5672".into(),
//!     connection_name: "docs:Publisher".into(),
//!     heartbeat_seconds: 60,
//!     connection_timeout_ms: 30_000,
//!     channel_max: 200,
//! };
//! let channel = broker.connect(&options).await?.create_channel().await?;
//! channel.exchange_declare(&ExchangeSpec::topic("order.events")).await?;
//! channel.queue_declare(&QueueSpec::new("audit")).await?;
//! channel.queue_bind("audit", "order.events", "order.#").await?;
//! channel
//!     .basic_publish("order.events", "order.created", false, &MessageProperties::default(), b"{}")
//!     .await?;
//!
//! assert_eq!(broker.queue_messages("audit").len(), 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConnectionOptions, Delivery, DeliveryCallback,
    QueueInfo, SubscriptionEndedCallback,
};
use crate::error::{MessagingError, Result};
use crate::message::{FieldValue, MessageProperties};
use crate::topology::{ExchangeKind, ExchangeSpec, QueueSpec};

/// Broker operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    Connect,
    ExchangeDeclare,
    QueueDeclare,
    QueueBind,
    Publish,
    Consume,
    Cancel,
}

/// A message as stored by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// How a consumer settled one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack {
        delivery_tag: u64,
        queue: String,
        message_id: Option<String>,
    },
    Nack {
        delivery_tag: u64,
        queue: String,
        message_id: Option<String>,
        requeue: bool,
    },
}

impl Settlement {
    pub fn is_ack(&self) -> bool {
        matches!(self, Settlement::Ack { .. })
    }

    pub fn queue(&self) -> &str {
        match self {
            Settlement::Ack { queue, .. } | Settlement::Nack { queue, .. } => queue,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Settlement::Ack { message_id, .. } | Settlement::Nack { message_id, .. } => message_id.as_deref(),
        }
    }
}

/// Number of calls the broker received, per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerCounters {
    pub connections: usize,
    pub channels: usize,
    pub exchange_declares: usize,
    pub queue_declares: usize,
    pub queue_binds: usize,
    pub publishes: usize,
    pub consumes: usize,
    pub cancels: usize,
}

struct ConsumerEntry {
    tag: String,
    channel_key: u64,
    /// Channel prefetch in effect when the consumer started
    prefetch: Option<u16>,
    callback: DeliveryCallback,
    on_ended: SubscriptionEndedCallback,
}

#[derive(Default)]
struct MemoryQueue {
    spec: Option<QueueSpec>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct Unacked {
    queue: String,
    channel_key: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    counters: BrokerCounters,
    connections: Vec<(ConnectionOptions, Arc<AtomicBool>)>,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    prefetch: HashMap<u64, u16>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<StoredMessage>,
    settlements: Vec<Settlement>,
    failures: HashMap<BrokerOp, usize>,
    blocked: bool,
    next_delivery_tag: u64,
    next_channel_key: u64,
    next_consumer_tag: u64,
}

type Dispatch = Vec<(DeliveryCallback, Delivery)>;
type Ended = Vec<(SubscriptionEndedCallback, String)>;

impl BrokerState {
    fn take_failure(&mut self, op: BrokerOp) -> Result<()> {
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(MessagingError::broker_error(format!("injected {:?} failure", op)))
            }
            _ => Ok(()),
        }
    }

    /// Enqueue `message` on every queue `exchange` routes it to.
    fn route(&mut self, exchange: &str, message: StoredMessage) -> Result<usize> {
        if exchange.is_empty() {
            return Ok(match self.queues.get_mut(&message.routing_key) {
                Some(queue) => {
                    queue.messages.push_back(message);
                    1
                }
                None => 0,
            });
        }

        let kind = self
            .exchanges
            .get(exchange)
            .map(|spec| spec.kind)
            .ok_or_else(|| MessagingError::broker_error(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|binding| binding.exchange == exchange)
            .filter(|binding| match kind {
                ExchangeKind::Direct => binding.routing_key == message.routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, &message.routing_key),
                // Bindings carry no match arguments, which headers exchanges treat as match-all
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            })
            .map(|binding| binding.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.messages.push_back(message.clone());
            }
        }
        Ok(targets.len())
    }

    /// Hand ready messages to consumers, round-robin per queue.
    fn drain_ready(&mut self) -> Dispatch {
        let mut dispatch = Vec::new();
        let mut handed_out = Vec::new();

        for (name, queue) in self.queues.iter_mut() {
            while !queue.consumers.is_empty() {
                let Some(message) = queue.messages.pop_front() else {
                    break;
                };
                let consumer = &queue.consumers[queue.next_consumer % queue.consumers.len()];
                queue.next_consumer = queue.next_consumer.wrapping_add(1);

                self.next_delivery_tag += 1;
                let delivery_tag = self.next_delivery_tag;
                dispatch.push((
                    consumer.callback.clone(),
                    Delivery {
                        delivery_tag,
                        exchange: message.exchange.clone(),
                        routing_key: message.routing_key.clone(),
                        redelivered: message.redelivered,
                        properties: message.properties.clone(),
                        body: message.body.clone(),
                    },
                ));
                handed_out.push((
                    delivery_tag,
                    Unacked {
                        queue: name.clone(),
                        channel_key: consumer.channel_key,
                        message,
                    },
                ));
            }
        }

        self.unacked.extend(handed_out);
        dispatch
    }

    fn dead_letter(&mut self, queue_name: &str, mut message: StoredMessage) {
        let spec = self.queues.get(queue_name).and_then(|queue| queue.spec.as_ref());
        let Some(exchange) = spec
            .and_then(|spec| spec.dead_letter_exchange())
            .map(str::to_string)
        else {
            debug!("Dropping rejected message from {} (no dead-letter exchange)", queue_name);
            return;
        };
        let routing_key = spec
            .and_then(|spec| spec.dead_letter_routing_key())
            .map(str::to_string)
            .unwrap_or_else(|| message.routing_key.clone());

        message
            .properties
            .headers
            .entry("x-first-death-queue".into())
            .or_insert_with(|| FieldValue::from(queue_name));
        message
            .properties
            .headers
            .entry("x-first-death-reason".into())
            .or_insert_with(|| FieldValue::from("rejected"));
        message
            .properties
            .headers
            .entry("x-first-death-exchange".into())
            .or_insert_with(|| FieldValue::from(message.exchange.clone()));
        message.exchange = exchange.clone();
        message.routing_key = routing_key;
        message.redelivered = false;

        if let Err(err) = self.route(&exchange, message) {
            warn!("Dead-lettering from {} failed: {}", queue_name, err);
        }
    }

    /// Remove the consumers `drop` selects, returning their end callbacks
    fn remove_consumers(&mut self, selected: impl Fn(&ConsumerEntry) -> bool) -> Ended {
        let mut ended = Vec::new();
        for queue in self.queues.values_mut() {
            let (gone, kept) = std::mem::take(&mut queue.consumers)
                .into_iter()
                .partition::<Vec<_>, _>(|consumer| selected(consumer));
            queue.consumers = kept;
            ended.extend(gone.into_iter().map(|consumer| (consumer.on_ended, consumer.tag)));
        }
        ended
    }

    /// Forget a closed channel: drop its consumers and requeue what it held.
    fn release_channel(&mut self, channel_key: u64) -> Ended {
        let ended = self.remove_consumers(|consumer| consumer.channel_key == channel_key);
        self.prefetch.remove(&channel_key);

        let held: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel_key == channel_key)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in held {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.messages.push_front(unacked.message);
                }
            }
        }
        ended
    }
}

fn dispatch(deliveries: Dispatch) {
    for (callback, delivery) in deliveries {
        tokio::spawn(callback(delivery));
    }
}

/// Run end callbacks outside the state lock
fn notify_ended(ended: Ended) {
    for (on_ended, tag) in ended {
        on_ended(&tag);
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&first, key_rest)) => (word == "*" || word == first) && matches(rest, key_rest),
                None => false,
            },
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Shared handle to one in-process broker. Clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `times` calls of `op` fail with a broker error
    pub fn fail_next(&self, op: BrokerOp, times: usize) {
        *self.state().failures.entry(op).or_default() += times;
    }

    pub fn counters(&self) -> BrokerCounters {
        self.state().counters
    }

    /// Options of every connection opened so far, in order
    pub fn connection_options(&self) -> Vec<ConnectionOptions> {
        self.state()
            .connections
            .iter()
            .map(|(options, _)| options.clone())
            .collect()
    }

    /// Number of connections that are still open
    pub fn open_connections(&self) -> usize {
        self.state()
            .connections
            .iter()
            .filter(|(_, open)| open.load(Ordering::SeqCst))
            .count()
    }

    /// Simulate the broker dropping every client connection.
    ///
    /// Consumers are cancelled and unacknowledged messages go back to their
    /// queues, as they would on a real broker.
    pub fn disconnect_all(&self) {
        let ended = {
            let mut state = self.state();
            for (_, open) in &state.connections {
                open.store(false, Ordering::SeqCst);
            }
            let mut channel_keys: Vec<u64> = state
                .queues
                .values()
                .flat_map(|queue| queue.consumers.iter().map(|consumer| consumer.channel_key))
                .chain(state.unacked.values().map(|unacked| unacked.channel_key))
                .collect();
            channel_keys.sort_unstable();
            channel_keys.dedup();
            let ended: Ended = channel_keys
                .into_iter()
                .flat_map(|key| state.release_channel(key))
                .collect();
            ended
        };
        notify_ended(ended);
    }

    /// Raise or clear a resource alarm; every connection reports itself blocked while raised
    pub fn set_blocked(&self, blocked: bool) {
        self.state().blocked = blocked;
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state().exchanges.get(name).cloned()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key)
    }

    /// Messages waiting on `queue`, oldest first
    pub fn queue_messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|queue| queue.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every message accepted by a publish call, in order
    pub fn published(&self) -> Vec<StoredMessage> {
        self.state().published.clone()
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.state()
            .queues
            .get(queue)
            .map(|queue| queue.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default()
    }

    pub fn prefetch_counts(&self) -> Vec<u16> {
        self.state().prefetch.values().copied().collect()
    }

    /// Prefetch limit the consumer `tag` was started with
    pub fn consumer_prefetch(&self, tag: &str) -> Option<u16> {
        self.state()
            .queues
            .values()
            .flat_map(|queue| queue.consumers.iter())
            .find(|consumer| consumer.tag == tag)
            .and_then(|consumer| consumer.prefetch)
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.state().settlements.clone()
    }

    /// Poll until at least `count` deliveries were settled or `timeout` elapses
    pub async fn wait_for_settlements(&self, count: usize, timeout: Duration) -> Vec<Settlement> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settlements = self.settlements();
            if settlements.len() >= count || tokio::time::Instant::now() >= deadline {
                return settlements;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("counters", &self.counters())
            .finish()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn BrokerConnection>> {
        let open = Arc::new(AtomicBool::new(true));
        {
            let mut state = self.state();
            state.take_failure(BrokerOp::Connect)?;
            state.counters.connections += 1;
            state.connections.push((options.clone(), open.clone()));
        }
        debug!("Memory connection {} opened", options.connection_name);

        Ok(Arc::new(MemoryConnection {
            name: options.connection_name.clone(),
            broker: self.clone(),
            open,
            next_channel_id: AtomicU16::new(1),
            channels: Mutex::new(Vec::new()),
        }))
    }
}

pub struct MemoryConnection {
    name: String,
    broker: MemoryBroker,
    open: Arc<AtomicBool>,
    next_channel_id: AtomicU16,
    channels: Mutex<Vec<u64>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_blocked(&self) -> bool {
        self.is_open() && self.broker.state().blocked
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(MessagingError::broker_error(format!("connection {} is closed", self.name)));
        }
        let key = {
            let mut state = self.broker.state();
            state.counters.channels += 1;
            state.next_channel_key += 1;
            state.next_channel_key
        };
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key);

        Ok(Arc::new(MemoryChannel {
            id: self.next_channel_id.fetch_add(1, Ordering::SeqCst),
            key,
            broker: self.broker.clone(),
            connection_open: self.open.clone(),
            open: AtomicBool::new(true),
        }))
    }

    /// Closing a connection closes its channels, as on a real broker
    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let keys = std::mem::take(&mut *self.channels.lock().unwrap_or_else(PoisonError::into_inner));
            let (ended, deliveries) = {
                let mut state = self.broker.state();
                let ended: Ended = keys
                    .into_iter()
                    .flat_map(|key| state.release_channel(key))
                    .collect();
                (ended, state.drain_ready())
            };
            notify_ended(ended);
            dispatch(deliveries);
        }
        Ok(())
    }
}

pub struct MemoryChannel {
    id: u16,
    key: u64,
    broker: MemoryBroker,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(MessagingError::broker_error(format!("channel {} is closed", self.id)))
        }
    }

    fn settle(&self, delivery_tag: u64, outcome: impl FnOnce(&Unacked) -> Settlement) -> Result<Unacked> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        let unacked = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| {
                MessagingError::broker_error(format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag))
            })?;
        let settlement = outcome(&unacked);
        state.settlements.push(settlement);
        Ok(unacked)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state.take_failure(BrokerOp::ExchangeDeclare)?;
        state.counters.exchange_declares += 1;

        if let Some(existing) = state.exchanges.get(&exchange.name) {
            if existing.kind != exchange.kind {
                return Err(MessagingError::broker_error(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                    exchange.name, exchange.kind, existing.kind
                )));
            }
            return Ok(());
        }
        state.exchanges.insert(exchange.name.clone(), exchange.clone());
        Ok(())
    }

    async fn queue_declare(&self, queue: &QueueSpec) -> Result<QueueInfo> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state.take_failure(BrokerOp::QueueDeclare)?;
        state.counters.queue_declares += 1;

        let entry = state.queues.entry(queue.name.clone()).or_default();
        entry.spec.get_or_insert_with(|| queue.clone());
        Ok(QueueInfo {
            name: queue.name.clone(),
            message_count: entry.messages.len() as u32,
            consumer_count: entry.consumers.len() as u32,
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state.take_failure(BrokerOp::QueueBind)?;
        state.counters.queue_binds += 1;

        if !state.queues.contains_key(queue) {
            return Err(MessagingError::broker_error(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::broker_error(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.ensure_open()?;
        self.broker.state().prefetch.insert(self.key, prefetch_count);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        let deliveries = {
            let mut state = self.broker.state();
            state.take_failure(BrokerOp::Publish)?;
            state.counters.publishes += 1;

            let message = StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
                properties: properties.clone(),
                body: body.to_vec(),
            };
            let routed = state.route(exchange, message.clone())?;
            if routed == 0 {
                if mandatory {
                    warn!("Unroutable mandatory message to {}/{}", exchange, routing_key);
                } else {
                    debug!("Message to {}/{} matched no queue", exchange, routing_key);
                }
            }
            state.published.push(message);
            state.drain_ready()
        };
        dispatch(deliveries);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        on_delivery: DeliveryCallback,
        on_ended: SubscriptionEndedCallback,
    ) -> Result<String> {
        self.ensure_open()?;
        let (tag, deliveries) = {
            let mut state = self.broker.state();
            state.take_failure(BrokerOp::Consume)?;
            state.counters.consumes += 1;

            let tag = if consumer_tag.is_empty() {
                state.next_consumer_tag += 1;
                format!("amq.ctag-{}", state.next_consumer_tag)
            } else {
                consumer_tag.to_string()
            };
            let channel_key = self.key;
            let prefetch = state.prefetch.get(&channel_key).copied();
            let Some(entry) = state.queues.get_mut(queue) else {
                return Err(MessagingError::broker_error(format!("NOT_FOUND - no queue '{}'", queue)));
            };
            entry.consumers.push(ConsumerEntry {
                tag: tag.clone(),
                channel_key,
                prefetch,
                callback: on_delivery,
                on_ended,
            });
            (tag, state.drain_ready())
        };
        dispatch(deliveries);
        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        let ended = {
            let mut state = self.broker.state();
            state.take_failure(BrokerOp::Cancel)?;
            state.counters.cancels += 1;
            state.remove_consumers(|consumer| consumer.tag == consumer_tag)
        };
        notify_ended(ended);
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.settle(delivery_tag, |unacked| Settlement::Ack {
            delivery_tag,
            queue: unacked.queue.clone(),
            message_id: unacked.message.properties.message_id.clone(),
        })?;
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut unacked = self.settle(delivery_tag, |unacked| Settlement::Nack {
            delivery_tag,
            queue: unacked.queue.clone(),
            message_id: unacked.message.properties.message_id.clone(),
            requeue,
        })?;

        let deliveries = {
            let mut state = self.broker.state();
            if requeue {
                unacked.message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                    queue.messages.push_front(unacked.message);
                }
            } else {
                state.dead_letter(&unacked.queue, unacked.message);
            }
            state.drain_ready()
        };
        dispatch(deliveries);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let (ended, deliveries) = {
                let mut state = self.broker.state();
                let ended = state.release_channel(self.key);
                (ended, state.drain_ready())
            };
            notify_ended(ended);
            dispatch(deliveries);
        }
        Ok(())
    }
}
