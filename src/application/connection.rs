//! Shared broker connections.
//!
//! One primary connection carries every command issued by this process; each
//! pub/sub channel gets its own dedicated connection. Establishing either goes
//! through a bounded retry loop driven by [`ReconnectState`].

use crate::adapters::events::{ConnectionEvent, EventHub};
use crate::error::ConnectionError;
use crate::ports::connection::{BrokerConnection, ConnectionFactory, SubscriberConnection};
use futures::future::{join_all, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OnceCell};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures after which connecting is abandoned.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            max_attempts: 10,
        }
    }
}

/// Counts consecutive failures and decides whether to try again.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    failures: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns the delay before the next attempt, or `None` once the policy is exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            None
        } else {
            Some(self.policy.delay_for(self.failures))
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Upper bound on establishing a connection, retries included.
    pub startup_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

pub struct ConnectionBroker<F: ConnectionFactory> {
    factory: Option<F>,
    settings: ConnectionSettings,
    primary: Mutex<Option<F::Connection>>,
    /// One slot per channel, so connecting one channel never blocks another.
    subscribers: parking_lot::Mutex<HashMap<String, Arc<OnceCell<F::Subscriber>>>>,
    events: EventHub<ConnectionEvent>,
}

impl<F: ConnectionFactory> ConnectionBroker<F> {
    pub fn new(factory: F, settings: ConnectionSettings) -> Self {
        Self::build(Some(factory), settings)
    }

    /// A broker with no address: every connection request fails with
    /// [`ConnectionError::Unconfigured`].
    pub fn unconfigured(settings: ConnectionSettings) -> Self {
        Self::build(None, settings)
    }

    fn build(factory: Option<F>, settings: ConnectionSettings) -> Self {
        Self {
            factory,
            settings,
            primary: Mutex::new(None),
            subscribers: parking_lot::Mutex::new(HashMap::new()),
            events: EventHub::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.factory.is_some()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// The shared command connection, established on first use.
    ///
    /// Concurrent first callers queue on the same lock, so only one of them
    /// actually connects; the rest receive a clone of its connection.
    pub async fn primary(&self) -> Result<F::Connection, ConnectionError> {
        let factory = self.factory.as_ref().ok_or(ConnectionError::Unconfigured)?;
        let mut slot = self.primary.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .establish_within("primary", || factory.connect())
            .await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// The connection dedicated to `channel`, created on first use.
    pub async fn subscriber(&self, channel: &str) -> Result<F::Subscriber, ConnectionError> {
        let factory = self.factory.as_ref().ok_or(ConnectionError::Unconfigured)?;
        let slot = self
            .subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .clone();
        slot.get_or_try_init(|| self.establish_within(channel, || factory.subscribe(channel)))
            .await
            .cloned()
    }

    /// Feed back an error seen while using the primary connection. Transient
    /// errors drop the connection so the next caller re-establishes it.
    pub async fn report_error(&self, err: &ConnectionError) {
        if !err.is_transient() {
            return;
        }
        if self.primary.lock().await.take().is_some() {
            warn!(error = %err, "primary broker connection lost, reconnecting on next use");
            self.events.publish(ConnectionEvent::Error {
                message: err.to_string(),
            });
        }
    }

    /// Ping the primary connection. Never fails; any problem reads as unhealthy.
    pub async fn health_check(&self) -> bool {
        match self.primary().await {
            Ok(conn) => conn.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    /// Close the primary and every subscriber connection concurrently.
    ///
    /// Individual close failures are logged and ignored. Afterwards the broker
    /// is back in its initial state, so `primary()` connects afresh.
    pub async fn shutdown(&self) {
        let primary = self.primary.lock().await.take();
        let subscribers: Vec<F::Subscriber> = self
            .subscribers
            .lock()
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();

        let mut closing = Vec::with_capacity(subscribers.len() + 1);
        if let Some(conn) = primary {
            closing.push(async move { ("primary".to_string(), conn.close().await) }.boxed());
        }
        for subscriber in subscribers {
            closing.push(
                async move {
                    let name = subscriber.channel().to_string();
                    (name, subscriber.close().await)
                }
                .boxed(),
            );
        }

        for (name, result) in join_all(closing).await {
            if let Err(e) = result {
                warn!(connection = %name, error = %e, "failed to close broker connection");
            }
        }
        info!("broker connections closed");
        self.events.publish(ConnectionEvent::Closed);
    }

    async fn establish_within<T, C, Fut>(&self, name: &str, connect: C) -> Result<T, ConnectionError>
    where
        C: Fn() -> Fut,
        Fut: Future<Output = Result<T, ConnectionError>>,
    {
        let timeout = self.settings.startup_timeout;
        match tokio::time::timeout(timeout, self.establish(name, connect)).await {
            Ok(result) => result,
            Err(_) => {
                error!(connection = %name, ?timeout, "broker connection not ready in time");
                self.events.publish(ConnectionEvent::Error {
                    message: format!("not ready within {:?}", timeout),
                });
                Err(ConnectionError::StartupTimeout(timeout))
            }
        }
    }

    async fn establish<T, C, Fut>(&self, name: &str, connect: C) -> Result<T, ConnectionError>
    where
        C: Fn() -> Fut,
        Fut: Future<Output = Result<T, ConnectionError>>,
    {
        let mut state = ReconnectState::new(self.settings.reconnect);
        loop {
            self.events.publish(ConnectionEvent::Connecting {
                attempt: state.failures() + 1,
            });
            let err = match connect().await {
                Ok(conn) => {
                    info!(connection = %name, "broker connection ready");
                    self.events.publish(ConnectionEvent::Ready);
                    return Ok(conn);
                }
                Err(err) => err,
            };

            self.events.publish(ConnectionEvent::Error {
                message: err.to_string(),
            });
            if !err.is_transient() {
                error!(connection = %name, error = %err, "broker connection failed");
                return Err(err);
            }

            match state.record_failure() {
                Some(delay) => {
                    warn!(
                        connection = %name,
                        attempt = state.failures(),
                        ?delay,
                        error = %err,
                        "broker connection failed, retrying"
                    );
                    self.events.publish(ConnectionEvent::Reconnecting {
                        attempt: state.failures(),
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        connection = %name,
                        attempts = state.failures(),
                        error = %err,
                        "giving up on broker connection"
                    );
                    self.events.publish(ConnectionEvent::RetriesExhausted {
                        attempts: state.failures(),
                    });
                    return Err(ConnectionError::RetriesExhausted {
                        attempts: state.failures(),
                        last_error: err.to_string(),
                    });
                }
            }
        }
    }
}
