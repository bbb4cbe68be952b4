//! Relays backpressure transitions between processes over a pub/sub channel.
//!
//! Each process publishes its own transitions on the primary connection and
//! listens on a dedicated subscriber connection. Messages carry the origin so
//! a process ignores its own echoes.

use super::EventHub;
use crate::application::connection::ConnectionBroker;
use crate::domain::backpressure::BackpressureEvent;
use crate::ports::connection::{BrokerConnection, ConnectionFactory, SubscriberConnection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedEvent {
    pub origin: String,
    pub event: BackpressureEvent,
}

pub fn spawn_publisher<F: ConnectionFactory>(
    connections: Arc<ConnectionBroker<F>>,
    mut events: broadcast::Receiver<BackpressureEvent>,
    channel: String,
    origin: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "backpressure relay fell behind");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let message = match serde_json::to_string(&RelayedEvent {
                origin: origin.clone(),
                event,
            }) {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "failed to encode backpressure event");
                    continue;
                }
            };
            let published = match connections.primary().await {
                Ok(conn) => conn.publish(&channel, &message).await,
                Err(e) => Err(e),
            };
            if let Err(e) = published {
                warn!(channel = %channel, error = %e, "failed to relay backpressure event");
                connections.report_error(&e).await;
            }
        }
        debug!("backpressure relay publisher stopped");
    })
}

/// Forwards transitions announced by other processes into `remote`.
pub fn spawn_listener<F: ConnectionFactory>(
    connections: Arc<ConnectionBroker<F>>,
    channel: String,
    origin: String,
    remote: EventHub<BackpressureEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let subscriber = match connections.subscriber(&channel).await {
            Ok(subscriber) => subscriber,
            Err(e) => {
                error!(channel = %channel, error = %e, "cannot listen for backpressure events");
                return;
            }
        };

        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => break,
                message = subscriber.next_message() => match message {
                    Some(raw) => raw,
                    None => break,
                },
            };

            match serde_json::from_str::<RelayedEvent>(&raw) {
                Ok(relayed) if relayed.origin == origin => {}
                Ok(relayed) => {
                    info!(
                        origin = %relayed.origin,
                        event = relayed.event.name(),
                        reason = ?relayed.event.status().reason,
                        "backpressure transition in another process"
                    );
                    remote.publish(relayed.event);
                }
                Err(e) => warn!(channel = %channel, error = %e, "ignoring malformed relay message"),
            }
        }
        debug!("backpressure relay listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::connection::tests::FakeFactory;
    use crate::application::connection::ConnectionSettings;
    use crate::domain::backpressure::{BackpressureReason, BackpressureStatus};
    use std::time::Duration;

    fn activated() -> BackpressureEvent {
        BackpressureEvent::Activated(BackpressureStatus {
            active: true,
            reason: BackpressureReason::MemoryLimit,
            ..BackpressureStatus::normal()
        })
    }

    #[tokio::test]
    async fn test_publisher_sends_tagged_events() {
        let factory = FakeFactory::default();
        let published = factory.published.clone();
        let connections = Arc::new(ConnectionBroker::new(factory, ConnectionSettings::default()));
        let local: EventHub<BackpressureEvent> = EventHub::new();
        let cancel = CancellationToken::new();

        let task = spawn_publisher(
            connections,
            local.subscribe(),
            "bp".into(),
            "proc-a".into(),
            cancel.clone(),
        );
        local.publish(activated());

        for _ in 0..100 {
            if !published.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let sent = published.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "bp");
        let relayed: RelayedEvent = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(relayed.origin, "proc-a");
        assert_eq!(relayed.event, activated());
    }

    #[tokio::test]
    async fn test_listener_skips_own_echoes() {
        let factory = FakeFactory::default();
        let inbox = factory.inbox.clone();
        let connections = Arc::new(ConnectionBroker::new(factory, ConnectionSettings::default()));
        connections.subscriber("bp").await.unwrap();
        let remote: EventHub<BackpressureEvent> = EventHub::new();
        let mut received = remote.subscribe();
        let cancel = CancellationToken::new();

        let task = spawn_listener(
            connections,
            "bp".into(),
            "proc-a".into(),
            remote.clone(),
            cancel.clone(),
        );

        let sender = inbox.lock().get("bp").cloned().unwrap();
        let own = RelayedEvent {
            origin: "proc-a".into(),
            event: activated(),
        };
        let other = RelayedEvent {
            origin: "proc-b".into(),
            event: activated(),
        };
        sender.send(serde_json::to_string(&own).unwrap()).await.unwrap();
        sender.send("not json".into()).await.unwrap();
        sender.send(serde_json::to_string(&other).unwrap()).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, activated());
        assert!(received.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
    }
}
