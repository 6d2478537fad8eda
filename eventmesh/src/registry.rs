use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::error::{MessagingError, Result};
use crate::event::{Event, EventType};
use crate::topology::{EventRouting, Topology};

/// Bidirectional map between event types, their routing and their wire names.
///
/// Built once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct RoutingRegistry {
    routing_by_type: HashMap<TypeId, EventRouting>,
    type_by_name: HashMap<&'static str, EventType>,
}

impl RoutingRegistry {
    /// Index `routes` by type and by display name.
    ///
    /// Fails when two distinct types share a display name, since inbound
    /// messages could not be decoded unambiguously.
    pub fn new<'a, I>(routes: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a (EventType, EventRouting)>,
    {
        let mut routing_by_type = HashMap::new();
        let mut type_by_name: HashMap<&'static str, EventType> = HashMap::new();

        for (event_type, routing) in routes {
            routing_by_type.insert(event_type.id(), routing.clone());

            if let Some(existing) = type_by_name.get(event_type.name()) {
                if existing != event_type {
                    return Err(MessagingError::DuplicateEventName {
                        name: event_type.name().to_string(),
                        first: existing.full_name(),
                        second: event_type.full_name(),
                    });
                }
                continue;
            }
            type_by_name.insert(event_type.name(), *event_type);
        }

        debug!("Registered {} event types", routing_by_type.len());

        Ok(Self {
            routing_by_type,
            type_by_name,
        })
    }

    pub fn from_topology(topology: &Topology) -> Result<Self> {
        Self::new(topology.routes())
    }

    /// Routing of a mapped event type
    pub fn routing(&self, event_type: &EventType) -> Result<&EventRouting> {
        self.routing_by_type
            .get(&event_type.id())
            .ok_or_else(|| MessagingError::RoutingNotFound {
                event_type: event_type.full_name().to_string(),
            })
    }

    pub fn routing_for<E: Event>(&self) -> Result<&EventRouting> {
        self.routing(&EventType::of::<E>())
    }

    /// Resolve an inbound wire type name
    pub fn resolve_type(&self, name: &str) -> Option<EventType> {
        self.type_by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.routing_by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routing_by_type.is_empty()
    }
}

/// Answers "which event types arrive on this queue"
pub trait QueueEventResolver: Send + Sync {
    fn event_types_for_queue(&self, queue_name: &str) -> HashSet<EventType>;
}

/// Resolver that matches a queue's binding against the event routing map
#[derive(Debug, Clone)]
pub struct TopologyEventResolver {
    topology: Arc<Topology>,
}

impl TopologyEventResolver {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self { topology }
    }
}

impl QueueEventResolver for TopologyEventResolver {
    /// Queue names match case-insensitively. Unknown or unbound queues
    /// resolve to nothing.
    fn event_types_for_queue(&self, queue_name: &str) -> HashSet<EventType> {
        let Some(queue) = self.topology.queue(queue_name) else {
            return HashSet::new();
        };
        let Some((exchange, routing_key)) = queue.binding() else {
            return HashSet::new();
        };

        self.topology
            .routes()
            .iter()
            .filter(|(_, routing)| routing.exchange_name == exchange && routing.routing_key == routing_key)
            .map(|(event_type, _)| *event_type)
            .collect()
    }
}
