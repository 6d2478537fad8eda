use thiserror::Error;

/// Result type alias for eventmesh operations
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors produced by the messaging layer
#[derive(Error, Debug)]
pub enum MessagingError {
    /// AMQP client errors
    #[error("AMQP connection error: {0}")]
    Connection(#[from] lapin::Error),

    /// Broker failures reported by a non-lapin transport
    #[error("Broker error: {0}")]
    Broker(String),

    /// Message serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connection string is missing or not an AMQP URI
    #[error("Invalid connection string: {reason}")]
    InvalidConnectionString { reason: String },

    /// Two event types registered under the same display name
    #[error("Event type name collision: '{name}' is used by both '{first}' and '{second}'")]
    DuplicateEventName {
        name: String,
        first: &'static str,
        second: &'static str,
    },

    /// Publishing an event type that was never mapped
    #[error("No routing registered for event type '{event_type}'")]
    RoutingNotFound { event_type: String },

    /// Inbound wire type name that resolves to no registered event
    #[error("Unknown event type '{type_name}'")]
    UnknownEventType { type_name: String },

    /// Event handler errors
    #[error("Handler error: {0}")]
    Handler(#[source] anyhow::Error),

    /// A second message processor was configured
    #[error("A message processor has already been configured")]
    ProcessorAlreadyConfigured,

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The connection manager was shut down
    #[error("Connection manager is closed")]
    Closed,
}

impl MessagingError {
    /// Create a new broker error
    pub fn broker_error<T: ToString>(message: T) -> Self {
        Self::Broker(message.to_string())
    }

    /// Create a new config error
    pub fn config_error<T: ToString>(message: T) -> Self {
        Self::Config(message.to_string())
    }

    /// Create a new invalid-state error
    pub fn invalid_state<T: ToString>(message: T) -> Self {
        Self::InvalidState(message.to_string())
    }

    /// Connectivity failures may succeed on retry; configuration and decoding
    /// failures never will.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Broker(_))
    }
}

impl From<config::ConfigError> for MessagingError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
