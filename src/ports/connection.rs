use crate::error::ConnectionError;
use async_trait::async_trait;

/// A live command connection. Clones share the same underlying socket.
#[async_trait]
pub trait BrokerConnection: Clone + Send + Sync + 'static {
    async fn ping(&self) -> Result<(), ConnectionError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), ConnectionError>;

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// A connection dedicated to one pub/sub channel. Never used for commands.
#[async_trait]
pub trait SubscriberConnection: Clone + Send + Sync + 'static {
    fn channel(&self) -> &str;

    /// Wait for the next message published on the channel.
    /// Returns `None` once the connection is closed.
    async fn next_message(&self) -> Option<String>;

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Opens connections to the broker. A single attempt per call; retrying is
/// the caller's business.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: BrokerConnection;
    type Subscriber: SubscriberConnection;

    async fn connect(&self) -> Result<Self::Connection, ConnectionError>;

    async fn subscribe(&self, channel: &str) -> Result<Self::Subscriber, ConnectionError>;
}
