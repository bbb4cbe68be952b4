//! Redis connections: one multiplexed command connection, one pub/sub
//! connection per channel.

use crate::error::ConnectionError;
use crate::ports::connection::{BrokerConnection, ConnectionFactory, SubscriberConnection};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct RedisConnection {
    inner: MultiplexedConnection,
}

impl RedisConnection {
    /// A handle for issuing commands. Clones share the socket.
    pub fn commands(&self) -> MultiplexedConnection {
        self.inner.clone()
    }
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    async fn ping(&self) -> Result<(), ConnectionError> {
        let mut conn = self.inner.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), ConnectionError> {
        let mut conn = self.inner.clone();
        let _: () = conn.publish(channel, message).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let mut conn = self.inner.clone();
        let _: () = redis::cmd("QUIT").query_async(&mut conn).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisSubscriber {
    channel: String,
    pubsub: Arc<Mutex<Option<PubSub>>>,
    closed: CancellationToken,
}

#[async_trait]
impl SubscriberConnection for RedisSubscriber {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_message(&self) -> Option<String> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            message = async {
                let mut guard = self.pubsub.lock().await;
                let pubsub = guard.as_mut()?;
                let message = pubsub.on_message().next().await?;
                message.get_payload::<String>().ok()
            } => message,
        }
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.closed.cancel();
        let pubsub = self.pubsub.lock().await.take();
        if let Some(mut pubsub) = pubsub {
            pubsub.unsubscribe(&self.channel).await?;
        }
        Ok(())
    }
}

pub struct RedisConnectionFactory {
    client: redis::Client,
}

impl RedisConnectionFactory {
    pub fn new(redis_url: &str) -> Result<Self, ConnectionError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ConnectionError::Fatal(format!("invalid broker url: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ConnectionFactory for RedisConnectionFactory {
    type Connection = RedisConnection;
    type Subscriber = RedisSubscriber;

    async fn connect(&self) -> Result<RedisConnection, ConnectionError> {
        let inner = self.client.get_multiplexed_async_connection().await?;
        Ok(RedisConnection { inner })
    }

    async fn subscribe(&self, channel: &str) -> Result<RedisSubscriber, ConnectionError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(RedisSubscriber {
            channel: channel.to_string(),
            pubsub: Arc::new(Mutex::new(Some(pubsub))),
            closed: CancellationToken::new(),
        })
    }
}
