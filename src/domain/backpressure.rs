use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureReason {
    QueueDepth,
    MemoryLimit,
    Manual,
    None,
}

/// Snapshot of the backpressure state, as exposed to health checks and alerting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureStatus {
    pub active: bool,
    pub reason: BackpressureReason,
    pub sampled_memory_mb: f64,
    pub sampled_queue_depth: u64,
    pub timestamp: DateTime<Utc>,
}

impl BackpressureStatus {
    pub fn normal() -> Self {
        Self {
            active: false,
            reason: BackpressureReason::None,
            sampled_memory_mb: 0.0,
            sampled_queue_depth: 0,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "status", rename_all = "snake_case")]
pub enum BackpressureEvent {
    Activated(BackpressureStatus),
    Deactivated(BackpressureStatus),
}

impl BackpressureEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BackpressureEvent::Activated(_) => "backpressure:activated",
            BackpressureEvent::Deactivated(_) => "backpressure:deactivated",
        }
    }

    pub fn status(&self) -> &BackpressureStatus {
        match self {
            BackpressureEvent::Activated(status) | BackpressureEvent::Deactivated(status) => {
                status
            }
        }
    }
}
