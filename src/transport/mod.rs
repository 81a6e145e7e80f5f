//! Broker transport.
//!
//! This module contains:
//! - `Transport`: dials the broker
//! - `BrokerConnection`: one live connection, opens logical channels
//! - `BrokerChannel`: consume from a named queue, publish to an exchange
//! - Implementations: AMQP (RabbitMQ), in-process
//!
//! The session layer only sees these traits; which broker sits underneath is
//! chosen when the session is created.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod in_process;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use in_process::{InProcessBroker, Published};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by the broker transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel open failed: {0}")]
    ChannelOpen(String),

    /// The peer closed the channel. The only error that triggers a reconnect.
    #[error("Channel closed by peer: {0}")]
    ChannelClosed(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Close failed: {0}")]
    Close(String),
}

impl TransportError {
    /// Whether this error means the channel was closed underneath us.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, TransportError::ChannelClosed(_))
    }
}

/// A message taken off a consumption queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Stream of deliveries for one consumer. Ends when the channel closes.
pub type Deliveries = BoxStream<'static, Result<Delivery>>;

/// Dials the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>>;

    /// Human-readable endpoint for logging. Must not contain credentials.
    fn endpoint(&self) -> String;
}

/// One live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a logical channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Close the connection.
    async fn close(&self) -> Result<()>;
}

/// Logical channel used either for consuming or for publishing.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Start consuming the named queue.
    async fn consume(&self, queue: &str) -> Result<Deliveries>;

    /// Publish a message body to an exchange with a routing key.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Close the channel. Consumers started on it stop.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_channel_closed_triggers_reconnect() {
        assert!(TransportError::ChannelClosed("504".to_string()).is_channel_closed());
        assert!(!TransportError::Publish("nack".to_string()).is_channel_closed());
        assert!(!TransportError::Connection("refused".to_string()).is_channel_closed());
    }
}
