use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::broker::BrokerChannel;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::event::{AnyEvent, Event};
use crate::message::MessageProperties;
use crate::registry::RoutingRegistry;
use crate::topology::EventRouting;

/// Value of the `Publisher` header
pub const PUBLISHER_NAME: &str = "EventPublisher";

/// Publishes events on the shared publisher connection.
///
/// The channel is opened on first use and reopened whenever it is found
/// closed. Failures are logged and returned to the caller; nothing is retried
/// here.
pub struct EventPublisher {
    connections: Arc<ConnectionManager>,
    registry: Arc<RoutingRegistry>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
}

impl EventPublisher {
    pub fn new(connections: Arc<ConnectionManager>, registry: Arc<RoutingRegistry>) -> Self {
        Self {
            connections,
            registry,
            channel: Mutex::new(None),
        }
    }

    /// Publish an event to the exchange and routing key mapped for `E`
    pub async fn publish<E: Event>(&self, event: &E) -> Result<()> {
        self.publish_dyn(event).await
    }

    /// Publish an event whose concrete type is only known at runtime
    pub async fn publish_dyn(&self, event: &dyn AnyEvent) -> Result<()> {
        let event_type = event.event_type();
        let routing = self.registry.routing(&event_type).map_err(|err| {
            error!("Cannot publish {}: {}", event_type.name(), err);
            err
        })?;

        debug!(
            exchange = %routing.exchange_name,
            routing_key = %routing.routing_key,
            "Publishing {}",
            event_type.name()
        );

        match self.send(event, routing).await {
            Ok(()) => {
                info!("Published {} to exchange {}", event_type.name(), routing.exchange_name);
                Ok(())
            }
            Err(err) => {
                error!(
                    "Failed to publish {} to {}/{}: {}",
                    event_type.name(),
                    routing.exchange_name,
                    routing.routing_key,
                    err
                );
                Err(err)
            }
        }
    }

    async fn send(&self, event: &dyn AnyEvent, routing: &EventRouting) -> Result<()> {
        let channel = self.channel().await?;
        let body = event.to_json()?;
        let properties = MessageProperties::for_event(event, PUBLISHER_NAME);

        channel
            .basic_publish(&routing.exchange_name, &routing.routing_key, false, &properties, &body)
            .await
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut current = self.channel.lock().await;
        if let Some(channel) = current.as_ref().filter(|channel| channel.is_open()) {
            return Ok(channel.clone());
        }

        let connection = self.connections.publisher_connection().await?;
        let channel = connection.create_channel().await?;
        debug!("Opened publisher channel {}", channel.id());
        *current = Some(channel.clone());
        Ok(channel)
    }

    /// Close the publisher's channel. The shared connection stays open.
    pub async fn close(&self) -> Result<()> {
        let Some(channel) = self.channel.lock().await.take() else {
            return Ok(());
        };
        channel.close().await?;
        debug!("Closed publisher channel {}", channel.id());
        Ok(())
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("routes", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{BrokerOp, MemoryBroker};
    use crate::connection::ConnectionConfig;
    use crate::error::MessagingError;
    use crate::event::EventMeta;
    use crate::message::{headers, FieldValue};
    use crate::topology::{ExchangeSpec, QueueSpec, Topology};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ShipmentDispatched {
        #[serde(flatten)]
        meta: EventMeta,
        tracking_number: String,
    }

    impl Event for ShipmentDispatched {
        fn meta(&self) -> EventMeta {
            self.meta
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct NeverMapped {
        #[serde(flatten)]
        meta: EventMeta,
    }

    impl Event for NeverMapped {
        fn meta(&self) -> EventMeta {
            self.meta
        }
    }

    struct Fixture {
        broker: MemoryBroker,
        connections: Arc<ConnectionManager>,
        publisher: EventPublisher,
    }

    async fn fixture() -> Fixture {
        let broker = MemoryBroker::new();
        let topology = Topology::builder()
            .add_exchange(ExchangeSpec::topic("shipping.events"))
            .add_queue(QueueSpec::new("notify-customer").bind("shipping.events", "shipping.#"))
            .map_event::<ShipmentDispatched>("shipping.events", "shipping.dispatched")
            .build()
            .unwrap();

        let connections = Arc::new(
            ConnectionManager::with_connector(
                ConnectionConfig::new("amqp://localhost", "shipping"),
                Arc::new(broker.clone()),
            )
            .unwrap(),
        );
        let setup = connections.create_dedicated_connection("setup").await.unwrap();
        let channel = setup.create_channel().await.unwrap();
        channel.exchange_declare(&topology.exchanges()[0]).await.unwrap();
        channel.queue_declare(&topology.queues()[0]).await.unwrap();
        channel
            .queue_bind("notify-customer", "shipping.events", "shipping.#")
            .await
            .unwrap();

        let registry = Arc::new(RoutingRegistry::from_topology(&topology).unwrap());
        let publisher = EventPublisher::new(connections.clone(), registry);
        Fixture {
            broker,
            connections,
            publisher,
        }
    }

    fn dispatched() -> ShipmentDispatched {
        ShipmentDispatched {
            meta: EventMeta::new(),
            tracking_number: "1Z999".into(),
        }
    }

    #[tokio::test]
    async fn test_publish_routes_and_stamps_envelope() {
        let fixture = fixture().await;
        let event = dispatched();
        fixture.publisher.publish(&event).await.unwrap();

        let messages = fixture.broker.queue_messages("notify-customer");
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.exchange, "shipping.events");
        assert_eq!(message.routing_key, "shipping.dispatched");

        let properties = &message.properties;
        assert_eq!(properties.kind.as_deref(), Some("ShipmentDispatched"));
        assert_eq!(properties.delivery_mode, Some(2));
        assert_eq!(
            properties.message_id.as_deref(),
            Some(event.meta.event_id.to_string().as_str())
        );
        assert_eq!(
            properties.get_header(headers::PUBLISHER),
            Some(&FieldValue::from(PUBLISHER_NAME))
        );

        let body: serde_json::Value = serde_json::from_slice(&message.body).unwrap();
        assert_eq!(body["trackingNumber"], "1Z999");
    }

    #[tokio::test]
    async fn test_unmapped_event_is_not_published() {
        let fixture = fixture().await;
        let err = fixture
            .publisher
            .publish(&NeverMapped { meta: EventMeta::new() })
            .await
            .unwrap_err();

        assert!(matches!(err, MessagingError::RoutingNotFound { .. }));
        assert_eq!(fixture.broker.counters().publishes, 0);
        // no connection was opened for it either
        assert!(!fixture.connections.stats().await.publisher_connected);
    }

    #[tokio::test]
    async fn test_channel_is_reused_and_reopened() {
        let fixture = fixture().await;
        let channels_before = fixture.broker.counters().channels;

        fixture.publisher.publish(&dispatched()).await.unwrap();
        fixture.publisher.publish(&dispatched()).await.unwrap();
        assert_eq!(fixture.broker.counters().channels, channels_before + 1);

        fixture.publisher.close().await.unwrap();
        fixture.publisher.publish(&dispatched()).await.unwrap();
        assert_eq!(fixture.broker.counters().channels, channels_before + 2);
        assert_eq!(fixture.broker.queue_messages("notify-customer").len(), 3);
    }

    #[tokio::test]
    async fn test_broker_failure_is_returned() {
        let fixture = fixture().await;
        fixture.broker.fail_next(BrokerOp::Publish, 1);

        let err = fixture.publisher.publish(&dispatched()).await.unwrap_err();
        assert!(err.is_recoverable());
        fixture.publisher.publish(&dispatched()).await.unwrap();
        assert_eq!(fixture.broker.queue_messages("notify-customer").len(), 1);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_fails() {
        let fixture = fixture().await;
        fixture.publisher.publish(&dispatched()).await.unwrap();
        fixture.publisher.close().await.unwrap();
        fixture.connections.close().await.unwrap();

        let err = fixture.publisher.publish(&dispatched()).await.unwrap_err();
        assert!(matches!(err, MessagingError::Closed));
    }
}
