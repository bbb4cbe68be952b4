//! Configuration read once at startup from the environment (and `.env`).
//!
//! Every setting has a default, so a missing or malformed variable never
//! stops the process.

use crate::application::backpressure::BackpressureConfig;
use crate::application::connection::ConnectionSettings;
use crate::application::worker::WorkerOptions;
use crate::domain::families::JobFamily;
use crate::domain::policy::QueuePolicy;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Which broker backs the queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerTarget {
    Redis(String),
    Memory,
    /// No address given: the core stays up but reports the broker unavailable.
    Unconfigured,
}

impl BrokerTarget {
    pub fn parse(url: Option<&str>) -> Self {
        match url.map(str::trim) {
            None | Some("") => BrokerTarget::Unconfigured,
            Some(url) if url.starts_with("memory://") => BrokerTarget::Memory,
            Some(url) => BrokerTarget::Redis(url.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FamilyConfig {
    pub policy: QueuePolicy,
    pub concurrency: usize,
}

impl FamilyConfig {
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            concurrency: self.concurrency,
            ..WorkerOptions::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    pub broker: BrokerTarget,
    /// Namespace for every broker key and channel
    pub prefix: String,
    pub connection: ConnectionSettings,
    pub backpressure: BackpressureConfig,
    pub families: HashMap<JobFamily, FamilyConfig>,
}

impl Config {
    /// Load `.env` if present, then read the environment.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str, default| parse_or(&lookup, key, default);

        let broker_url = lookup("BROKER_URL").or_else(|| lookup("REDIS_URL"));
        let connection = ConnectionSettings {
            startup_timeout: Duration::from_millis(read("BROKER_STARTUP_TIMEOUT_MS", 5_000)),
            ..ConnectionSettings::default()
        };

        let defaults = BackpressureConfig::default();
        let backpressure = BackpressureConfig {
            max_queue_size: parse_or(&lookup, "BACKPRESSURE_MAX_QUEUE_SIZE", defaults.max_queue_size),
            max_memory_mb: parse_or(&lookup, "BACKPRESSURE_MAX_MEMORY_MB", defaults.max_memory_mb),
            check_interval: Duration::from_millis(read(
                "BACKPRESSURE_CHECK_INTERVAL_MS",
                defaults.check_interval.as_millis() as u64,
            )),
        };

        let families = JobFamily::ALL
            .iter()
            .map(|family| {
                let prefix = family.env_prefix();
                let mut policy = family.default_policy();
                policy.timeout_ms = read(&format!("{}_TIMEOUT_MS", prefix), policy.timeout_ms);
                policy.max_attempts = parse_or(
                    &lookup,
                    &format!("{}_MAX_ATTEMPTS", prefix),
                    policy.max_attempts,
                )
                .max(1);
                let concurrency = parse_or(
                    &lookup,
                    &format!("{}_CONCURRENCY", prefix),
                    family.default_concurrency(),
                )
                .max(1);
                (*family, FamilyConfig { policy, concurrency })
            })
            .collect();

        Self {
            addr: lookup("ADDR").unwrap_or_else(|| String::from("127.0.0.1")),
            port: lookup("PORT").unwrap_or_else(|| String::from("3000")),
            broker: BrokerTarget::parse(broker_url.as_deref()),
            prefix: lookup("BROKER_PREFIX").unwrap_or_else(|| String::from("backstage")),
            connection,
            backpressure,
            families,
        }
    }

    pub fn family(&self, family: JobFamily) -> FamilyConfig {
        self.families.get(&family).cloned().unwrap_or_else(|| FamilyConfig {
            policy: family.default_policy(),
            concurrency: family.default_concurrency(),
        })
    }

    /// Channel over which backpressure transitions are shared between processes.
    pub fn backpressure_channel(&self) -> String {
        format!("{}:events:backpressure", self.prefix)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable setting");
                default
            }
        },
    }
}
