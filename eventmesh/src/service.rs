use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::broker::{AmqpConnector, BrokerConnector};
use crate::config::MessagingSettings;
use crate::connection::{ConnectionManager, ConnectionStats, INFRASTRUCTURE_SETUP};
use crate::consumer::{ConsumerState, EventConsumer};
use crate::error::{MessagingError, Result};
use crate::event::Event;
use crate::handler::{HandlerLookup, HandlerRegistry, MessageProcessor};
use crate::provisioner::TopologyProvisioner;
use crate::publisher::EventPublisher;
use crate::registry::{QueueEventResolver, RoutingRegistry};
use crate::topology::{Topology, TopologyBuilder};

/// Service lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Built, nothing declared or subscribed yet
    Created,
    /// Infrastructure provisioned and consumer (if enabled) subscribed
    Running,
    ShuttingDown,
    Stopped,
}

/// Collects settings, topology and handlers for a [`MessagingService`]
pub struct MessagingServiceBuilder {
    settings: MessagingSettings,
    topology: TopologyBuilder,
    defaults: Vec<Topology>,
    processor: Option<(Arc<dyn MessageProcessor>, Arc<dyn HandlerLookup>)>,
    resolver: Option<Arc<dyn QueueEventResolver>>,
    connector: Option<Arc<dyn BrokerConnector>>,
}

impl std::fmt::Debug for MessagingServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingServiceBuilder")
            .field("settings", &self.settings)
            .field("topology", &self.topology)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl MessagingServiceBuilder {
    fn new(settings: MessagingSettings) -> Self {
        Self {
            topology: settings.topology_builder(),
            settings,
            defaults: Vec::new(),
            processor: None,
            resolver: None,
            connector: None,
        }
    }

    /// Adjust the topology seeded from the settings
    pub fn topology(mut self, configure: impl FnOnce(TopologyBuilder) -> TopologyBuilder) -> Self {
        self.topology = configure(self.topology);
        self
    }

    /// Route events of type `E` to `exchange_name` with `routing_key`
    pub fn map_event<E: Event>(mut self, exchange_name: &str, routing_key: &str) -> Self {
        self.topology = self.topology.map_event::<E>(exchange_name, routing_key);
        self
    }

    /// Exchanges, queues and mappings added unless already configured under
    /// the same name
    pub fn with_default_topology(mut self, defaults: Topology) -> Self {
        self.defaults.push(defaults);
        self
    }

    /// Use a handler registry as both the message processor and the handler lookup
    pub fn with_handlers(self, handlers: HandlerRegistry) -> Result<Self> {
        let handlers = Arc::new(handlers);
        self.set_processor(handlers.clone(), handlers)
    }

    /// Install the message processor. Only one may be configured.
    pub fn set_processor(
        mut self,
        processor: Arc<dyn MessageProcessor>,
        handlers: Arc<dyn HandlerLookup>,
    ) -> Result<Self> {
        if self.processor.is_some() {
            return Err(MessagingError::ProcessorAlreadyConfigured);
        }
        self.processor = Some((processor, handlers));
        Ok(self)
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn QueueEventResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace the AMQP transport, e.g. with an in-memory broker
    pub fn with_connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> Result<MessagingService> {
        self.settings.validate()?;

        let topology = self
            .defaults
            .iter()
            .fold(self.topology, |builder, defaults| builder.merge_defaults(defaults))
            .build()?;
        let topology = Arc::new(topology);
        let registry = Arc::new(RoutingRegistry::from_topology(&topology)?);

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(AmqpConnector::new()));
        let connections = Arc::new(ConnectionManager::with_connector(
            self.settings.connection_config(),
            connector,
        )?);

        let consumer = match (self.settings.consumer_enabled, self.processor) {
            (true, Some((processor, handlers))) => {
                let consumer = EventConsumer::new(
                    self.settings.application_name.clone(),
                    topology.clone(),
                    connections.clone(),
                    registry.clone(),
                    processor,
                    handlers,
                )
                .with_cancel_grace(self.settings.cancel_grace());
                let consumer = match self.resolver {
                    Some(resolver) => consumer.with_resolver(resolver),
                    None => consumer,
                };
                Some(Arc::new(consumer))
            }
            (true, None) => {
                return Err(MessagingError::config_error(
                    "consumer is enabled but no message processor was configured; \
                     register handlers or call set_processor",
                ));
            }
            (false, processor) => {
                if processor.is_some() {
                    debug!("Message processor configured but the consumer is disabled");
                }
                None
            }
        };

        let provisioner = Arc::new(TopologyProvisioner::new(topology.clone()));
        let publisher = Arc::new(EventPublisher::new(connections.clone(), registry.clone()));

        info!(
            "Created messaging service {} ({} exchange(s), {} queue(s), {} route(s), consumer {})",
            self.settings.application_name,
            topology.exchanges().len(),
            topology.queues().len(),
            registry.len(),
            if consumer.is_some() { "enabled" } else { "disabled" }
        );

        Ok(MessagingService {
            settings: self.settings,
            topology,
            registry,
            connections,
            provisioner,
            publisher,
            consumer,
            status: RwLock::new(ServiceStatus::Created),
        })
    }
}

/// Owns the connection manager, provisioner, publisher and consumer of one
/// application.
pub struct MessagingService {
    settings: MessagingSettings,
    topology: Arc<Topology>,
    registry: Arc<RoutingRegistry>,
    connections: Arc<ConnectionManager>,
    provisioner: Arc<TopologyProvisioner>,
    publisher: Arc<EventPublisher>,
    consumer: Option<Arc<EventConsumer>>,
    status: RwLock<ServiceStatus>,
}

impl MessagingService {
    pub fn builder(settings: MessagingSettings) -> MessagingServiceBuilder {
        MessagingServiceBuilder::new(settings)
    }

    /// Provision the topology (unless disabled) and start consuming (if enabled).
    ///
    /// A failed start leaves the service in [`ServiceStatus::Created`] so it
    /// can be started again.
    pub async fn start(&self) -> Result<()> {
        let mut status = self.status.write().await;
        if *status != ServiceStatus::Created {
            return Err(MessagingError::invalid_state(format!(
                "service cannot start while {:?}",
                *status
            )));
        }

        info!("Starting messaging service {}", self.settings.application_name);

        if self.settings.setup_infrastructure {
            self.setup_infrastructure().await?;
        } else {
            debug!("Infrastructure setup disabled, skipping provisioning");
        }

        if let Some(consumer) = &self.consumer {
            consumer.start().await?;
        }

        *status = ServiceStatus::Running;
        info!("Messaging service {} is running", self.settings.application_name);
        Ok(())
    }

    /// Declare the topology on a dedicated connection, closed afterwards
    pub async fn setup_infrastructure(&self) -> Result<()> {
        info!("Setting up messaging infrastructure");
        let connection = self
            .connections
            .create_dedicated_connection(INFRASTRUCTURE_SETUP)
            .await?;

        let outcome = match connection.create_channel().await {
            Ok(channel) => {
                let provisioned = self.provisioner.ensure_provisioned(channel.as_ref()).await;
                if let Err(err) = channel.close().await {
                    warn!("Failed to close infrastructure channel: {}", err);
                }
                provisioned
            }
            Err(err) => Err(err),
        };

        if let Err(err) = connection.close().await {
            warn!("Failed to close {} connection: {}", connection.name(), err);
        }

        match outcome {
            Ok(()) => {
                info!("Messaging infrastructure is ready");
                Ok(())
            }
            Err(err) => {
                error!("Messaging infrastructure setup failed: {}", err);
                Err(err)
            }
        }
    }

    /// Stop consuming, then close the publisher channel and both shared connections.
    ///
    /// In-flight messages get up to `grace` to finish. Every step runs even if
    /// an earlier one failed; the first failure is returned.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        {
            let mut status = self.status.write().await;
            if matches!(*status, ServiceStatus::ShuttingDown | ServiceStatus::Stopped) {
                return Ok(());
            }
            *status = ServiceStatus::ShuttingDown;
        }
        info!("Shutting down messaging service {}", self.settings.application_name);

        let mut first_error = None;
        if let Some(consumer) = &self.consumer {
            if let Err(err) = consumer.stop(grace).await {
                error!("Failed to stop consumer: {}", err);
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.publisher.close().await {
            warn!("Failed to close publisher: {}", err);
            first_error.get_or_insert(err);
        }
        if let Err(err) = self.connections.close().await {
            warn!("Failed to close connections: {}", err);
            first_error.get_or_insert(err);
        }

        *self.status.write().await = ServiceStatus::Stopped;
        info!("Messaging service {} stopped", self.settings.application_name);
        first_error.map_or(Ok(()), Err)
    }

    /// Shut down with the configured cancel grace period
    pub async fn shutdown_gracefully(&self) -> Result<()> {
        self.shutdown(self.settings.cancel_grace()).await
    }

    /// Shared publisher; safe to use from many tasks
    pub fn publisher(&self) -> Arc<EventPublisher> {
        self.publisher.clone()
    }

    pub fn consumer(&self) -> Option<Arc<EventConsumer>> {
        self.consumer.clone()
    }

    pub fn settings(&self) -> &MessagingSettings {
        &self.settings
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn registry(&self) -> &RoutingRegistry {
        &self.registry
    }

    pub fn connections(&self) -> Arc<ConnectionManager> {
        self.connections.clone()
    }

    pub async fn status(&self) -> ServiceStatus {
        *self.status.read().await
    }

    pub async fn stats(&self) -> ServiceStats {
        let (consumer_state, subscriptions) = match &self.consumer {
            Some(consumer) => (Some(consumer.state()), consumer.consumer_tags().len()),
            None => (None, 0),
        };

        ServiceStats {
            application_name: self.settings.application_name.clone(),
            status: self.status().await,
            connection_stats: self.connections.stats().await,
            provisioned_entities: self.provisioner.provisioned().await.len(),
            consumer_state,
            subscriptions,
        }
    }

    /// Running, no shared connection dropped since it was last used, and the
    /// consumer (when enabled) still subscribed
    pub async fn is_healthy(&self) -> bool {
        if self.status().await != ServiceStatus::Running || !self.connections.is_healthy().await {
            return false;
        }
        self.consumer
            .as_ref()
            .map_or(true, |consumer| consumer.state() == ConsumerState::Running)
    }
}

impl std::fmt::Debug for MessagingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingService")
            .field("application_name", &self.settings.application_name)
            .field("connections", &self.connections)
            .field("consumer", &self.consumer.is_some())
            .finish()
    }
}

/// Service statistics for monitoring
#[derive(Debug, Clone)]
pub struct ServiceStats {
    pub application_name: String,
    pub status: ServiceStatus,
    pub connection_stats: ConnectionStats,
    pub provisioned_entities: usize,
    pub consumer_state: Option<ConsumerState>,
    pub subscriptions: usize,
}
