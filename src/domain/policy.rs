use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay schedule between failed attempts of a job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^attempts_made`, optionally scaled by a random factor in [0.5, 1.0].
    Exponential { delay_ms: u64, jitter: bool },
}

impl Backoff {
    pub fn exponential(delay: Duration) -> Self {
        Backoff::Exponential {
            delay_ms: delay.as_millis() as u64,
            jitter: false,
        }
    }

    /// Delay before the next attempt, given the attempts made before the one that just failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms, jitter } => {
                let factor = 1u64.checked_shl(attempts_made).unwrap_or(u64::MAX);
                let millis = delay_ms.saturating_mul(factor);
                if jitter && millis > 0 {
                    let scale = rand::thread_rng().gen_range(0.5..=1.0);
                    Duration::from_millis((millis as f64 * scale) as u64)
                } else {
                    Duration::from_millis(millis)
                }
            }
        }
    }
}

/// Per-queue defaults, fixed when the queue is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub timeout_ms: u64,
    /// Completed jobs kept for inspection before eviction.
    pub retain_completed: usize,
    /// Failed jobs kept for inspection before eviction.
    pub retain_failed: usize,
}

impl QueuePolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(1)),
            timeout_ms: 60_000,
            retain_completed: 100,
            retain_failed: 500,
        }
    }
}
