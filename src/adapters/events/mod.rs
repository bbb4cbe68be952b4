use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod hub;
pub mod relay;

pub use hub::EventHub;

/// Connection lifecycle transitions, published for logging and alerting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting { attempt: u32 },
    Ready,
    Error { message: String },
    Reconnecting { attempt: u32, delay: Duration },
    RetriesExhausted { attempts: u32 },
    Closed,
}

/// Job transitions reported by workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Completed {
        queue: String,
        id: String,
    },
    Retrying {
        queue: String,
        id: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    Failed {
        queue: String,
        id: String,
        attempts_made: u32,
        reason: String,
    },
}
