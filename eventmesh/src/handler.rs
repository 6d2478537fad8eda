use async_trait::async_trait;
use futures_util::future::join_all;
use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{MessagingError, Result};
use crate::event::{AnyEvent, Event, EventType};
use crate::message::MessageContext;

/// Application code reacting to one event type
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: &E, context: &MessageContext) -> anyhow::Result<()>;

    /// Handler name for logs
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Receives every decoded inbound event
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(
        &self,
        event: &dyn AnyEvent,
        event_type: EventType,
        context: &MessageContext,
    ) -> Result<()>;
}

/// Answers whether the application handles an event type
pub trait HandlerLookup: Send + Sync {
    fn has_handler_for(&self, event_type: &EventType) -> bool;
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn dispatch(&self, event: &dyn AnyEvent, context: &MessageContext) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

struct TypedHandler<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> ErasedHandler for TypedHandler<E, H>
where
    E: Event,
    H: EventHandler<E>,
{
    async fn dispatch(&self, event: &dyn AnyEvent, context: &MessageContext) -> anyhow::Result<()> {
        let event = event.downcast_ref::<E>().ok_or_else(|| {
            anyhow::anyhow!(
                "handler {} expected {} but received {}",
                self.handler.name(),
                EventType::of::<E>().full_name(),
                event.event_type().full_name()
            )
        })?;
        self.handler.handle(event, context).await
    }

    fn name(&self) -> &'static str {
        self.handler.name()
    }
}

/// Startup-built table from event type to its handlers.
///
/// Dispatch goes straight through the table: every handler registered for
/// the event's type runs concurrently, and the first failure fails the
/// message once all of them have finished.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TypeId, Vec<Arc<dyn ErasedHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for events of type `E`
    pub fn register<E, H>(&mut self, handler: H) -> &mut Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let typed = TypedHandler {
            handler,
            _event: PhantomData,
        };
        info!(
            "Registered handler {} for event type {}",
            typed.name(),
            EventType::of::<E>().name()
        );
        self.handlers
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Arc::new(typed));
        self
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl HandlerLookup for HandlerRegistry {
    fn has_handler_for(&self, event_type: &EventType) -> bool {
        self.handlers.contains_key(&event_type.id())
    }
}

#[async_trait]
impl MessageProcessor for HandlerRegistry {
    async fn process(
        &self,
        event: &dyn AnyEvent,
        event_type: EventType,
        context: &MessageContext,
    ) -> Result<()> {
        let Some(handlers) = self.handlers.get(&event_type.id()) else {
            warn!("No handler found for event type {}", event_type.name());
            return Ok(());
        };

        let started = Instant::now();
        let results = join_all(handlers.iter().map(|handler| async move {
            debug!(
                "Executing handler {} for event {} from message {}",
                handler.name(),
                event_type.name(),
                context.message_id
            );
            handler
                .dispatch(event, context)
                .await
                .map_err(|err| (handler.name(), err))
        }))
        .await;
        let elapsed_ms = started.elapsed().as_millis();

        let mut first_error = None;
        for result in results {
            if let Err((name, err)) = result {
                error!(
                    "Handler {} failed for event {} after {}ms. MessageId: {}: {:#}",
                    name,
                    event_type.name(),
                    elapsed_ms,
                    context.message_id,
                    err
                );
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(MessagingError::Handler(err)),
            None => {
                debug!(
                    "{} handler(s) for {} completed in {}ms",
                    handlers.len(),
                    event_type.name(),
                    elapsed_ms
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.handlers.len())
            .field("handlers", &self.handler_count())
            .finish()
    }
}
