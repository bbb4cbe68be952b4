//! Monolith Binary - single-process deployment
//!
//! It wires up:
//! - The job broker (Redis, in-process, or unconfigured)
//! - One queue per job family, with per-family policy overrides
//! - The backpressure monitor and its cross-process relay
//! - The admin HTTP surface

use backstage::adapters::events::{relay, EventHub};
use backstage::adapters::http::{self, AdminState};
use backstage::adapters::memory::MemoryBroker;
use backstage::adapters::process::ProcessMemorySampler;
use backstage::adapters::redis::{RedisBroker, RedisConnectionFactory, RedisConnections};
use backstage::application::connection::ConnectionBroker;
use backstage::config::{BrokerTarget, Config};
use backstage::domain::families::JobFamily;
use backstage::ports::broker::JobBroker;
use backstage::{BackpressureManager, QueueRegistry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cancel = CancellationToken::new();

    // 1. Broker
    let (broker, connections): (Arc<dyn JobBroker>, Option<Arc<RedisConnections>>) =
        match &config.broker {
            BrokerTarget::Redis(url) => {
                let factory = match RedisConnectionFactory::new(url) {
                    Ok(factory) => factory,
                    Err(e) => {
                        error!(error = %e, "invalid broker configuration");
                        std::process::exit(1);
                    }
                };
                let connections = Arc::new(ConnectionBroker::new(factory, config.connection));
                if let Err(e) = connections.primary().await {
                    error!(error = %e, "broker unavailable, refusing to start");
                    std::process::exit(1);
                }
                let broker: Arc<dyn JobBroker> =
                    Arc::new(RedisBroker::new(connections.clone(), config.prefix.clone()));
                (broker, Some(connections))
            }
            BrokerTarget::Memory => {
                info!("using the in-process broker; jobs do not survive a restart");
                let broker: Arc<dyn JobBroker> = Arc::new(MemoryBroker::new());
                (broker, None)
            }
            BrokerTarget::Unconfigured => {
                warn!("BROKER_URL is not set; queue operations will report the broker unavailable");
                let connections = Arc::new(RedisConnections::unconfigured(config.connection));
                let broker: Arc<dyn JobBroker> =
                    Arc::new(RedisBroker::new(connections, config.prefix.clone()));
                (broker, None)
            }
        };

    // 2. Queues
    let registry = Arc::new(QueueRegistry::new(broker));
    for family in JobFamily::ALL {
        registry.create_queue(family.queue_name(), config.family(family).policy);
    }

    // 3. Backpressure
    let backpressure = Arc::new(BackpressureManager::new(
        config.backpressure,
        registry.clone(),
        Arc::new(ProcessMemorySampler::new()),
    ));
    for name in registry.queue_names() {
        backpressure.register(name);
    }
    let monitor = backpressure.clone().start(cancel.clone());

    if let Some(connections) = &connections {
        let origin = Uuid::new_v4().to_string();
        let channel = config.backpressure_channel();
        relay::spawn_publisher(
            connections.clone(),
            backpressure.subscribe(),
            channel.clone(),
            origin.clone(),
            cancel.clone(),
        );
        relay::spawn_listener(
            connections.clone(),
            channel,
            origin,
            EventHub::new(),
            cancel.clone(),
        );
    }

    // 4. Admin HTTP
    let app = http::router(AdminState {
        registry,
        backpressure,
    });
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.addr, config.port))
        .await
        .expect("Failed to bind TCP listener");
    info!("Listening at {}:{}", config.addr, config.port);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
            shutdown.cancel();
        })
        .await
        .expect("Server failed");

    // 5. Teardown
    cancel.cancel();
    if let Err(e) = monitor.await {
        warn!(error = %e, "backpressure monitor ended abnormally");
    }
    if let Some(connections) = connections {
        connections.shutdown().await;
    }
}
