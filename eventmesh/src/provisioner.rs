use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::broker::BrokerChannel;
use crate::error::Result;
use crate::topology::Topology;

/// Everything declared on the broker during this process's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionedSet {
    pub exchanges: HashSet<String>,
    pub queues: HashSet<String>,
    /// Keys of the form `"{queue}->{exchange}|{routing_key}"`
    pub bindings: HashSet<String>,
}

impl ProvisionedSet {
    pub fn len(&self) -> usize {
        self.exchanges.len() + self.queues.len() + self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Declares the topology's exchanges, queues and bindings exactly once.
///
/// Every declaration is checked against and recorded in one guarded
/// [`ProvisionedSet`], so concurrent callers never declare the same entity
/// twice. An entity is recorded only after the broker confirmed it; a failure
/// aborts the pass and the next call picks up where it stopped.
pub struct TopologyProvisioner {
    topology: Arc<Topology>,
    provisioned: Mutex<ProvisionedSet>,
}

impl TopologyProvisioner {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self {
            topology,
            provisioned: Mutex::new(ProvisionedSet::default()),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub async fn ensure_provisioned(&self, channel: &dyn BrokerChannel) -> Result<()> {
        for exchange in self.topology.exchanges() {
            let mut provisioned = self.provisioned.lock().await;
            if provisioned.exchanges.contains(&exchange.name) {
                continue;
            }
            channel.exchange_declare(exchange).await.map_err(|err| {
                error!("Failed to declare exchange {}: {}", exchange.name, err);
                err
            })?;
            provisioned.exchanges.insert(exchange.name.clone());
            info!(
                "Declared exchange {} (type: {}, durable: {})",
                exchange.name, exchange.kind, exchange.durable
            );
        }

        for queue in self.topology.queues() {
            {
                let mut provisioned = self.provisioned.lock().await;
                if !provisioned.queues.contains(&queue.name) {
                    let declared = channel.queue_declare(queue).await.map_err(|err| {
                        error!("Failed to declare queue {}: {}", queue.name, err);
                        err
                    })?;
                    provisioned.queues.insert(queue.name.clone());
                    info!(
                        "Declared queue {} (durable: {}, messages: {}, consumers: {})",
                        queue.name, queue.durable, declared.message_count, declared.consumer_count
                    );
                }
            }

            let (Some((exchange, routing_key)), Some(binding_key)) = (queue.binding(), queue.binding_key())
            else {
                debug!("Queue {} has no binding", queue.name);
                continue;
            };

            let mut provisioned = self.provisioned.lock().await;
            if provisioned.bindings.contains(&binding_key) {
                continue;
            }
            channel
                .queue_bind(&queue.name, exchange, routing_key)
                .await
                .map_err(|err| {
                    error!(
                        "Failed to bind queue {} to {} with key {}: {}",
                        queue.name, exchange, routing_key, err
                    );
                    err
                })?;
            provisioned.bindings.insert(binding_key);
            info!("Bound queue {} to {} with key {}", queue.name, exchange, routing_key);
        }

        Ok(())
    }

    /// Snapshot of what has been declared so far
    pub async fn provisioned(&self) -> ProvisionedSet {
        self.provisioned.lock().await.clone()
    }
}

impl std::fmt::Debug for TopologyProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyProvisioner")
            .field("exchanges", &self.topology.exchanges().len())
            .field("queues", &self.topology.queues().len())
            .finish()
    }
}
