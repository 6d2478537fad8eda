use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerChannel, Delivery, DeliveryCallback, SubscriptionEndedCallback};
use crate::connection::ConnectionManager;
use crate::error::{MessagingError, Result};
use crate::handler::{HandlerLookup, MessageProcessor};
use crate::message::{event_type_or_unknown, message_id_or_new, MessageContext};
use crate::registry::{QueueEventResolver, RoutingRegistry, TopologyEventResolver};
use crate::topology::{QueueSpec, Topology};

const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of an [`EventConsumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Default)]
struct Subscriptions {
    channel: Option<Arc<dyn BrokerChannel>>,
    tags: Vec<String>,
}

/// State shared with every delivery and subscription callback
struct Dispatcher {
    registry: Arc<RoutingRegistry>,
    processor: Arc<dyn MessageProcessor>,
    in_flight: AtomicUsize,
    idle: Notify,
    state: StdMutex<ConsumerState>,
    /// Consumer tags whose delivery stream is still expected to be live
    live: StdMutex<Vec<String>>,
}

/// Counts one delivery from the moment the broker hands it over until it is settled
struct InFlight(Arc<Dispatcher>);

impl InFlight {
    fn enter(dispatcher: Arc<Dispatcher>) -> Self {
        dispatcher.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(dispatcher)
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.0
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Dispatcher {
    fn state(&self) -> ConsumerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn live_tags(&self) -> Vec<String> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn track(&self, tag: &str) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tag.to_string());
    }

    /// Returns false when the tag was no longer tracked
    fn untrack(&self, tag: &str) -> bool {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        match live.iter().position(|live_tag| live_tag == tag) {
            Some(idx) => {
                live.remove(idx);
                true
            }
            None => false,
        }
    }

    fn untrack_all(&self) {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Switch to Running unless one of the `expected` subscriptions already ended
    fn mark_running(&self, expected: usize) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.live.lock().unwrap_or_else(PoisonError::into_inner).len() < expected {
            return false;
        }
        *state = ConsumerState::Running;
        true
    }

    fn subscription_ended(&self, tag: &str) {
        if !self.untrack(tag) {
            debug!("Consumer {} cancelled", tag);
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        warn!("Consumer {} lost its subscription while {:?}", tag, *state);
        if *state == ConsumerState::Running {
            *state = ConsumerState::Stopped;
            error!("Event consumer stopped after losing consumer {}; start it again to resubscribe", tag);
        }
    }

    async fn handle_delivery(&self, channel: &dyn BrokerChannel, queue: &str, delivery: Delivery) {
        let message_id = message_id_or_new(&delivery.properties);
        let type_name = event_type_or_unknown(&delivery.properties);

        debug!(queue = %queue, message_id = %message_id, event_type = %type_name, "Processing message");

        match self.dispatch(queue, &message_id, type_name, &delivery).await {
            Ok(()) => match channel.basic_ack(delivery.delivery_tag).await {
                Ok(()) => debug!("Message {} of type {} processed", message_id, type_name),
                Err(err) => error!("Failed to ack message {}: {}", message_id, err),
            },
            Err(err) => {
                match &err {
                    MessagingError::UnknownEventType { .. } => {
                        warn!("{} for message {} on queue {}, rejecting", err, message_id, queue)
                    }
                    MessagingError::Serialization(_) => error!(
                        "Failed to deserialize message {} as {}: {}",
                        message_id, type_name, err
                    ),
                    _ => error!(
                        "Processing message {} of type {} from queue {} failed: {}",
                        message_id, type_name, queue, err
                    ),
                }
                reject(channel, delivery.delivery_tag, &message_id).await;
            }
        }
    }

    /// Resolve, decode and process one delivery
    async fn dispatch(&self, queue: &str, message_id: &str, type_name: &str, delivery: &Delivery) -> Result<()> {
        let event_type =
            self.registry
                .resolve_type(type_name)
                .ok_or_else(|| MessagingError::UnknownEventType {
                    type_name: type_name.to_string(),
                })?;
        let event = event_type.decode(&delivery.body)?;

        let mut context = MessageContext::from_properties(&delivery.properties, queue);
        context.message_id = message_id.to_string();
        if context.is_retry() {
            debug!("Message {} is on retry {}", message_id, context.retry_count);
        }

        AssertUnwindSafe(self.processor.process(event.as_ref(), event_type, &context))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(MessagingError::Handler(anyhow::anyhow!(
                    "message processor panicked"
                )))
            })
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Reject without requeue; the queue's dead-letter wiring decides what happens next
async fn reject(channel: &dyn BrokerChannel, delivery_tag: u64, message_id: &str) {
    match channel.basic_nack(delivery_tag, false).await {
        Ok(()) => debug!("Rejected message {} without requeue", message_id),
        Err(err) => error!("Failed to reject message {}: {}", message_id, err),
    }
}

/// Subscribes to every configured queue whose events have a handler and
/// feeds deliveries through decode, dispatch and acknowledgement.
///
/// Each delivery runs on its own task, so up to `prefetch` messages per queue
/// are processed concurrently. A successful dispatch is acked; an unknown
/// type, an undecodable body or a failed dispatch is rejected once, without
/// requeue.
///
/// The broker client does not recover subscriptions. When a delivery stream
/// ends without [`stop`](Self::stop) (connection loss, queue deleted) the
/// consumer falls back to [`ConsumerState::Stopped`]; [`start`](Self::start)
/// then resubscribes on a fresh consumer connection.
pub struct EventConsumer {
    application_name: String,
    topology: Arc<Topology>,
    connections: Arc<ConnectionManager>,
    handlers: Arc<dyn HandlerLookup>,
    resolver: Arc<dyn QueueEventResolver>,
    dispatcher: Arc<Dispatcher>,
    cancel_grace: Duration,
    subscriptions: Mutex<Subscriptions>,
}

impl EventConsumer {
    pub fn new(
        application_name: impl Into<String>,
        topology: Arc<Topology>,
        connections: Arc<ConnectionManager>,
        registry: Arc<RoutingRegistry>,
        processor: Arc<dyn MessageProcessor>,
        handlers: Arc<dyn HandlerLookup>,
    ) -> Self {
        Self {
            application_name: application_name.into(),
            resolver: Arc::new(TopologyEventResolver::new(topology.clone())),
            topology,
            connections,
            handlers,
            dispatcher: Arc::new(Dispatcher {
                registry,
                processor,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                state: StdMutex::new(ConsumerState::Stopped),
                live: StdMutex::new(Vec::new()),
            }),
            cancel_grace: DEFAULT_CANCEL_GRACE,
            subscriptions: Mutex::new(Subscriptions::default()),
        }
    }

    /// Replace the default topology-based queue resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn QueueEventResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Grace period for releasing subscriptions left behind by a lost connection
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.dispatcher.state()
    }

    /// Tags of the subscriptions whose delivery stream is live
    pub fn consumer_tags(&self) -> Vec<String> {
        self.dispatcher.live_tags()
    }

    /// Deliveries currently being processed
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        let state = self.state();
        if state != ConsumerState::Stopped {
            return Err(MessagingError::invalid_state(format!(
                "consumer cannot start while {:?}",
                state
            )));
        }

        self.dispatcher.set_state(ConsumerState::Starting);
        if subscriptions.channel.is_some() {
            debug!("Releasing subscriptions of the lost consumer channel");
            self.release(&mut subscriptions, self.cancel_grace).await;
        }
        info!("Starting event consumer for {}", self.application_name);

        let outcome = match self.subscribe_all(&mut subscriptions).await {
            Ok(started) if !self.dispatcher.mark_running(started) => Err(MessagingError::broker_error(
                "a subscription ended while the consumer was starting",
            )),
            outcome => outcome,
        };

        match outcome {
            Ok(started) => {
                info!("Event consumer started with {} subscription(s)", started);
                Ok(())
            }
            Err(err) => {
                error!("Failed to start event consumer: {}", err);
                self.release(&mut subscriptions, Duration::ZERO).await;
                self.dispatcher.set_state(ConsumerState::Stopped);
                Err(err)
            }
        }
    }

    async fn subscribe_all(&self, subscriptions: &mut Subscriptions) -> Result<usize> {
        let connection = self.connections.consumer_connection().await?;
        let channel = connection.create_channel().await?;
        subscriptions.channel = Some(channel.clone());

        for queue in self.topology.queues() {
            let event_types = self.resolver.event_types_for_queue(&queue.name);
            if !event_types
                .iter()
                .any(|event_type| self.handlers.has_handler_for(event_type))
            {
                debug!("No handler for any event on queue {}, not subscribing", queue.name);
                continue;
            }

            let tag = self.subscribe(&channel, queue).await.map_err(|err| {
                error!("Failed to start consumer for queue {}: {}", queue.name, err);
                err
            })?;
            subscriptions.tags.push(tag);
        }

        Ok(subscriptions.tags.len())
    }

    async fn subscribe(&self, channel: &Arc<dyn BrokerChannel>, queue: &QueueSpec) -> Result<String> {
        // RabbitMQ applies a non-global qos to consumers started after it, so
        // a queue without a limit resets it instead of inheriting the previous one
        channel.basic_qos(queue.prefetch_count.unwrap_or(0)).await?;

        let consumer_tag = format!(
            "{}-{}-{}",
            self.application_name,
            queue.name,
            Uuid::now_v7().simple()
        );

        let dispatcher = self.dispatcher.clone();
        let delivery_channel = channel.clone();
        let queue_name: Arc<str> = Arc::from(queue.name.as_str());
        let on_delivery: DeliveryCallback = Arc::new(move |delivery: Delivery| {
            let in_flight = InFlight::enter(dispatcher.clone());
            let channel = delivery_channel.clone();
            let queue_name = queue_name.clone();
            async move {
                in_flight
                    .dispatcher()
                    .handle_delivery(channel.as_ref(), &queue_name, delivery)
                    .await
            }
            .boxed()
        });

        let dispatcher = self.dispatcher.clone();
        let on_ended: SubscriptionEndedCallback = Arc::new(move |tag: &str| dispatcher.subscription_ended(tag));

        self.dispatcher.track(&consumer_tag);
        let tag = match channel
            .basic_consume(&queue.name, &consumer_tag, on_delivery, on_ended)
            .await
        {
            Ok(tag) => tag,
            Err(err) => {
                self.dispatcher.untrack(&consumer_tag);
                return Err(err);
            }
        };
        if tag != consumer_tag && self.dispatcher.untrack(&consumer_tag) {
            self.dispatcher.track(&tag);
        }

        info!("Consumer {} started for queue {}", tag, queue.name);
        Ok(tag)
    }

    /// Cancel every subscription and close the channel.
    ///
    /// Each cancel is bounded by `grace`; failures are logged and the next
    /// subscription is cancelled regardless. Deliveries already handed to the
    /// consumer get up to `grace` to finish before the channel closes.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        if self.state() == ConsumerState::Stopped && subscriptions.channel.is_none() {
            return Ok(());
        }

        self.dispatcher.set_state(ConsumerState::Stopping);
        info!("Stopping event consumer for {}", self.application_name);
        self.release(&mut subscriptions, grace).await;
        self.dispatcher.set_state(ConsumerState::Stopped);
        info!("Event consumer stopped");
        Ok(())
    }

    async fn release(&self, subscriptions: &mut Subscriptions, grace: Duration) {
        self.dispatcher.untrack_all();
        let Some(channel) = subscriptions.channel.take() else {
            subscriptions.tags.clear();
            return;
        };

        for tag in subscriptions.tags.drain(..) {
            match tokio::time::timeout(grace, channel.basic_cancel(&tag)).await {
                Ok(Ok(())) => debug!("Cancelled consumer {}", tag),
                Ok(Err(err)) => warn!("Failed to cancel consumer {}: {}", tag, err),
                Err(_) => warn!("Cancelling consumer {} timed out after {:?}", tag, grace),
            }
        }

        if tokio::time::timeout(grace, self.dispatcher.wait_idle()).await.is_err() {
            warn!(
                "{} message(s) still in flight after {:?}, closing channel",
                self.in_flight(),
                grace
            );
        }

        if let Err(err) = channel.close().await {
            warn!("Failed to close consumer channel: {}", err);
        }
    }
}

impl std::fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("application_name", &self.application_name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{BrokerOp, MemoryBroker};
    use crate::broker::BrokerConnector;
    use crate::connection::ConnectionConfig;
    use crate::event::{AnyEvent, Event, EventMeta, EventType};
    use crate::handler::{EventHandler, HandlerRegistry};
    use crate::message::{headers, MessageProperties};
    use crate::topology::ExchangeSpec;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicBool;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct StockReserved {
        #[serde(flatten)]
        meta: EventMeta,
        sku: String,
    }

    impl Event for StockReserved {
        fn meta(&self) -> EventMeta {
            self.meta
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct StockReleased {
        #[serde(flatten)]
        meta: EventMeta,
    }

    impl Event for StockReleased {
        fn meta(&self) -> EventMeta {
            self.meta
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<(String, u32)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl EventHandler<StockReserved> for Arc<Recorder> {
        async fn handle(&self, event: &StockReserved, context: &MessageContext) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push((event.sku.clone(), context.retry_count));
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("warehouse offline");
            }
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl MessageProcessor for Panics {
        async fn process(&self, _: &dyn AnyEvent, _: EventType, _: &MessageContext) -> Result<()> {
            panic!("boom")
        }
    }

    impl HandlerLookup for Panics {
        fn has_handler_for(&self, _: &EventType) -> bool {
            true
        }
    }

    struct Fixture {
        broker: MemoryBroker,
        recorder: Arc<Recorder>,
        consumer: EventConsumer,
        publish_channel: Arc<dyn BrokerChannel>,
    }

    fn topology() -> Arc<Topology> {
        Arc::new(
            Topology::builder()
                .add_exchange(ExchangeSpec::topic("inventory.events"))
                .add_queue(
                    QueueSpec::new("reserve-stock")
                        .bind("inventory.events", "stock.reserved")
                        .with_prefetch(4),
                )
                .add_queue(QueueSpec::new("release-stock").bind("inventory.events", "stock.released"))
                .map_event::<StockReserved>("inventory.events", "stock.reserved")
                .map_event::<StockReleased>("inventory.events", "stock.released")
                .build()
                .unwrap(),
        )
    }

    async fn fixture_with(processor: Option<(Arc<dyn MessageProcessor>, Arc<dyn HandlerLookup>)>) -> Fixture {
        let broker = MemoryBroker::new();
        let topology = topology();

        let connections = Arc::new(
            ConnectionManager::with_connector(
                ConnectionConfig::new("amqp://localhost", "inventory"),
                Arc::new(broker.clone()),
            )
            .unwrap(),
        );
        let publish_channel = broker
            .connect(&connections.config().options_for(&crate::broker::ConnectionRole::Publisher))
            .await
            .unwrap()
            .create_channel()
            .await
            .unwrap();
        let provisioner = crate::provisioner::TopologyProvisioner::new(topology.clone());
        provisioner.ensure_provisioned(publish_channel.as_ref()).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let (processor, handlers) = processor.unwrap_or_else(|| {
            let mut registry = HandlerRegistry::new();
            registry.register::<StockReserved, _>(recorder.clone());
            let registry = Arc::new(registry);
            (registry.clone() as Arc<dyn MessageProcessor>, registry as Arc<dyn HandlerLookup>)
        });

        let routing = Arc::new(RoutingRegistry::from_topology(&topology).unwrap());
        let consumer = EventConsumer::new("inventory", topology, connections, routing, processor, handlers);
        Fixture {
            broker,
            recorder,
            consumer,
            publish_channel,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(None).await
    }

    async fn send(fixture: &Fixture, properties: MessageProperties, body: &[u8]) {
        fixture
            .publish_channel
            .basic_publish("inventory.events", "stock.reserved", false, &properties, body)
            .await
            .unwrap();
    }

    fn reserved(sku: &str) -> (MessageProperties, Vec<u8>) {
        let event = StockReserved {
            meta: EventMeta::new(),
            sku: sku.into(),
        };
        (
            MessageProperties::for_event(&event, "test"),
            serde_json::to_vec(&event).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_subscribes_only_to_handled_queues() {
        let fixture = fixture().await;
        fixture.consumer.start().await.unwrap();

        assert_eq!(fixture.consumer.state(), ConsumerState::Running);
        let tags = fixture.broker.consumer_tags("reserve-stock");
        assert_eq!(tags.len(), 1);
        assert!(tags[0].starts_with("inventory-reserve-stock-"));
        assert_eq!(tags[0].len(), "inventory-reserve-stock-".len() + 32);
        assert!(fixture.broker.consumer_tags("release-stock").is_empty());
        assert_eq!(fixture.broker.prefetch_counts(), vec![4]);
        assert_eq!(fixture.consumer.consumer_tags(), tags);
    }

    #[tokio::test]
    async fn test_handled_message_is_acked() {
        let fixture = fixture().await;
        fixture.consumer.start().await.unwrap();

        let (properties, body) = reserved("SKU-1");
        let properties = properties.with_header(headers::RETRY_COUNT, 1i64);
        send(&fixture, properties, &body).await;

        let settlements = fixture
            .broker
            .wait_for_settlements(1, Duration::from_secs(2))
            .await;
        assert_eq!(settlements.len(), 1);
        assert!(settlements[0].is_ack());
        assert_eq!(*fixture.recorder.seen.lock().unwrap(), vec![("SKU-1".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_unknown_type_is_rejected_without_processing() {
        let fixture = fixture().await;
        fixture.consumer.start().await.unwrap();

        let properties = MessageProperties::default()
            .with_kind("SomethingElse")
            .with_message_id("m-unknown");
        send(&fixture, properties, b"{}").await;

        let settlements = fixture
            .broker
            .wait_for_settlements(1, Duration::from_secs(2))
            .await;
        assert!(matches!(
            &settlements[..],
            [crate::broker::memory::Settlement::Nack { requeue: false, .. }]
        ));
        assert!(fixture.recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_type_fails_dispatch_as_unknown_event_type() {
        let fixture = fixture().await;
        let delivery = Delivery {
            delivery_tag: 1,
            exchange: "inventory.events".into(),
            routing_key: "stock.reserved".into(),
            redelivered: false,
            properties: MessageProperties::default().with_kind("StockCounted"),
            body: b"{}".to_vec(),
        };

        let err = fixture
            .consumer
            .dispatcher
            .dispatch("reserve-stock", "m-1", "StockCounted", &delivery)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::UnknownEventType { type_name } if type_name == "StockCounted"));
    }

    #[tokio::test]
    async fn test_missing_type_is_rejected() {
        let fixture = fixture().await;
        fixture.consumer.start().await.unwrap();

        send(&fixture, MessageProperties::default(), b"{}").await;
        let settlements = fixture
            .broker
            .wait_for_settlements(1, Duration::from_secs(2))
            .await;
        assert_eq!(settlements.len(), 1);
        assert!(!settlements[0].is_ack());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_rejected() {
        let fixture = fixture().await;
        fixture.consumer.start().await.unwrap();

        let (properties, _) = reserved("SKU-2");
        send(&fixture, properties, b"not json").await;

        let settlements = fixture
            .broker
            .wait_for_settlements(1, Duration::from_secs(2))
            .await;
        assert_eq!(settlements.len(), 1);
        assert!(!settlements[0].is_ack());
        assert!(fixture.recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_rejects_exactly_once() {
        let fixture = fixture().await;
        fixture.recorder.fail.store(true, Ordering::SeqCst);
        fixture.consumer.start().await.unwrap();

        let (properties, body) = reserved("SKU-3");
        send(&fixture, properties, &body).await;

        fixture
            .broker
            .wait_for_settlements(1, Duration::from_secs(2))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let settlements = fixture.broker.settlements();
        assert_eq!(settlements.len(), 1);
        assert!(matches!(
            settlements[0],
            crate::broker::memory::Settlement::Nack { requeue: false, .. }
        ));
        assert_eq!(fixture.recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_processor_panic_rejects() {
        let processor = Arc::new(Panics);
        let fixture = fixture_with(Some((
            processor.clone() as Arc<dyn MessageProcessor>,
            processor as Arc<dyn HandlerLookup>,
        )))
        .await;
        fixture.consumer.start().await.unwrap();

        let (properties, body) = reserved("SKU-4");
        send(&fixture, properties, &body).await;

        let settlements = fixture
            .broker
            .wait_for_settlements(1, Duration::from_secs(2))
            .await;
        assert_eq!(settlements.len(), 1);
        assert!(!settlements[0].is_ack());
        assert_eq!(fixture.consumer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let fixture = fixture().await;
        fixture.consumer.start().await.unwrap();
        assert!(matches!(
            fixture.consumer.start().await,
            Err(MessagingError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_start_returns_to_stopped() {
        let fixture = fixture().await;
        fixture.broker.fail_next(BrokerOp::Consume, 1);

        assert!(fixture.consumer.start().await.is_err());
        assert_eq!(fixture.consumer.state(), ConsumerState::Stopped);
        assert!(fixture.consumer.consumer_tags().is_empty());

        fixture.consumer.start().await.unwrap();
        assert_eq!(fixture.consumer.state(), ConsumerState::Running);
    }

    #[tokio::test]
    async fn test_stop_cancels_and_allows_restart() {
        let fixture = fixture().await;
        fixture.consumer.start().await.unwrap();

        fixture.broker.fail_next(BrokerOp::Cancel, 1);
        fixture.consumer.stop(Duration::from_millis(100)).await.unwrap();
        assert_eq!(fixture.consumer.state(), ConsumerState::Stopped);
        assert!(fixture.consumer.consumer_tags().is_empty());
        // the channel close drops the consumer whose cancel failed
        assert!(fixture.broker.consumer_tags("reserve-stock").is_empty());

        fixture.consumer.stop(Duration::from_millis(100)).await.unwrap();
        fixture.consumer.start().await.unwrap();
        assert_eq!(fixture.broker.consumer_tags("reserve-stock").len(), 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_delivery_handed_over_before_it() {
        let fixture = fixture().await;
        fixture.consumer.start().await.unwrap();

        let (properties, body) = reserved("SKU-5");
        send(&fixture, properties, &body).await;
        assert_eq!(fixture.consumer.in_flight(), 1);

        fixture.consumer.stop(Duration::from_secs(1)).await.unwrap();

        let settlements = fixture.broker.settlements();
        assert_eq!(settlements.len(), 1);
        assert!(settlements[0].is_ack());
        assert!(fixture.broker.queue_messages("reserve-stock").is_empty());
        assert_eq!(fixture.recorder.seen.lock().unwrap().len(), 1);
        assert_eq!(fixture.consumer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_lost_subscription_stops_consumer_until_restarted() {
        let fixture = fixture().await;
        fixture.consumer.start().await.unwrap();

        fixture.broker.disconnect_all();
        assert_eq!(fixture.consumer.state(), ConsumerState::Stopped);
        assert!(fixture.consumer.consumer_tags().is_empty());

        fixture.consumer.start().await.unwrap();
        assert_eq!(fixture.consumer.state(), ConsumerState::Running);
        let tags = fixture.broker.consumer_tags("reserve-stock");
        assert_eq!(tags.len(), 1);
        assert_eq!(fixture.consumer.consumer_tags(), tags);

        let publish_channel = fixture
            .broker
            .connect(&ConnectionConfig::default().options_for(&crate::broker::ConnectionRole::Publisher))
            .await
            .unwrap()
            .create_channel()
            .await
            .unwrap();
        let (properties, body) = reserved("SKU-6");
        publish_channel
            .basic_publish("inventory.events", "stock.reserved", false, &properties, &body)
            .await
            .unwrap();
        let settlements = fixture
            .broker
            .wait_for_settlements(1, Duration::from_secs(2))
            .await;
        assert!(settlements[0].is_ack());
    }

    #[tokio::test]
    async fn test_stop_releases_channel_of_lost_subscription() {
        let fixture = fixture().await;
        fixture.consumer.start().await.unwrap();
        fixture.broker.disconnect_all();

        fixture.consumer.stop(Duration::from_millis(100)).await.unwrap();
        assert_eq!(fixture.consumer.state(), ConsumerState::Stopped);
        // the channel died with its connection, so no cancel reached the broker
        assert_eq!(fixture.broker.counters().cancels, 0);
        fixture.consumer.stop(Duration::from_millis(100)).await.unwrap();
    }

    struct Restock;

    #[async_trait]
    impl EventHandler<StockReleased> for Restock {
        async fn handle(&self, _event: &StockReleased, _context: &MessageContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_queue_without_prefetch_does_not_inherit_limit() {
        let mut registry = HandlerRegistry::new();
        registry.register::<StockReserved, _>(Arc::new(Recorder::default()));
        registry.register::<StockReleased, _>(Restock);
        let registry = Arc::new(registry);
        let fixture = fixture_with(Some((
            registry.clone() as Arc<dyn MessageProcessor>,
            registry as Arc<dyn HandlerLookup>,
        )))
        .await;
        fixture.consumer.start().await.unwrap();

        let reserve = fixture.broker.consumer_tags("reserve-stock");
        let release = fixture.broker.consumer_tags("release-stock");
        assert_eq!(fixture.broker.consumer_prefetch(&reserve[0]), Some(4));
        assert_eq!(fixture.broker.consumer_prefetch(&release[0]), Some(0));
    }
}
