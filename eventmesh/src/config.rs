use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::connection::{validate_connection_string, ConnectionConfig};
use crate::error::Result;
use crate::topology::{ExchangeSpec, QueueSpec, TopologyBuilder};

/// Settings file looked up next to the working directory (`messaging.toml`, `.yaml`, ...)
pub const SETTINGS_FILE: &str = "messaging";

/// Prefix of the environment variables overriding the settings file
pub const ENV_PREFIX: &str = "EVENTMESH";

/// Messaging configuration for one application.
///
/// Loaded from defaults, then an optional `messaging` settings file, then
/// `EVENTMESH_*` environment variables. Nested keys use a double underscore,
/// e.g. `EVENTMESH_CONNECTION__HEARTBEAT_SECONDS=30`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagingSettings {
    pub connection_string: String,
    pub application_name: String,
    /// Declare the topology on a dedicated connection at startup
    pub setup_infrastructure: bool,
    /// Subscribe to queues at startup
    pub consumer_enabled: bool,
    #[serde(default)]
    pub exchanges: Vec<ExchangeSpec>,
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
    pub connection: ConnectionSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    pub heartbeat_seconds: u16,
    pub connection_timeout_ms: u64,
    pub publisher_channel_max: u16,
    pub consumer_channel_max: u16,
    pub dedicated_channel_max: u16,
    /// Upper bound for cancelling each subscription and draining in-flight
    /// messages at shutdown
    pub cancel_grace_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            heartbeat_seconds: defaults.heartbeat_seconds,
            connection_timeout_ms: defaults.connection_timeout_ms,
            publisher_channel_max: defaults.publisher_channel_max,
            consumer_channel_max: defaults.consumer_channel_max,
            dedicated_channel_max: defaults.dedicated_channel_max,
            cancel_grace_ms: 5_000,
        }
    }
}

impl MessagingSettings {
    pub fn new(connection_string: impl Into<String>, application_name: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            application_name: application_name.into(),
            setup_infrastructure: true,
            consumer_enabled: false,
            exchanges: Vec::new(),
            queues: Vec::new(),
            connection: ConnectionSettings::default(),
        }
    }

    /// Load settings from the optional settings file and the environment
    pub fn load() -> Result<Self> {
        let builder = Self::defaults()?
            .add_source(File::with_name(SETTINGS_FILE).required(false))
            .add_source(environment());
        Self::build(builder)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let connection = ConnectionSettings::default();
        let builder = Config::builder()
            .set_default("connection_string", "")?
            .set_default("application_name", "eventmesh")?
            .set_default("setup_infrastructure", true)?
            .set_default("consumer_enabled", false)?
            .set_default("connection.heartbeat_seconds", i64::from(connection.heartbeat_seconds))?
            .set_default("connection.connection_timeout_ms", connection.connection_timeout_ms)?
            .set_default(
                "connection.publisher_channel_max",
                i64::from(connection.publisher_channel_max),
            )?
            .set_default(
                "connection.consumer_channel_max",
                i64::from(connection.consumer_channel_max),
            )?
            .set_default(
                "connection.dedicated_channel_max",
                i64::from(connection.dedicated_channel_max),
            )?
            .set_default("connection.cancel_grace_ms", connection.cancel_grace_ms)?;
        Ok(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings: Self = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject a blank or non-AMQP connection string
    pub fn validate(&self) -> Result<()> {
        validate_connection_string(&self.connection_string)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.connection_string.clone(),
            application_name: self.application_name.clone(),
            connection_timeout_ms: self.connection.connection_timeout_ms,
            heartbeat_seconds: self.connection.heartbeat_seconds,
            publisher_channel_max: self.connection.publisher_channel_max,
            consumer_channel_max: self.connection.consumer_channel_max,
            dedicated_channel_max: self.connection.dedicated_channel_max,
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.connection.cancel_grace_ms)
    }

    /// A topology builder seeded with the configured exchanges and queues
    pub fn topology_builder(&self) -> TopologyBuilder {
        let builder = self
            .exchanges
            .iter()
            .cloned()
            .fold(TopologyBuilder::new(), TopologyBuilder::add_exchange);
        self.queues.iter().cloned().fold(builder, TopologyBuilder::add_queue)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
