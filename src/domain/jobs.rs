use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Highest accepted priority value. Lower values are dispatched first.
pub const MAX_PRIORITY: u32 = 1 << 21;

/// How long past its timeout a claimed job may go without a recorded outcome
/// before the broker takes it back.
pub const STALL_GRACE: Duration = Duration::from_secs(30);

pub const STALLED_REASON: &str = "stalled: no outcome recorded before the lease expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    /// Waiting for a backoff or initial delay to elapse.
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// The only states `clean` may remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Completed,
    Failed,
}

impl From<TerminalState> for JobState {
    fn from(state: TerminalState) -> Self {
        match state {
            TerminalState::Completed => JobState::Completed,
            TerminalState::Failed => JobState::Failed,
        }
    }
}

/// A unit of work as stored by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub priority: Option<u32>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: JobState,
    pub progress: Option<u8>,
    pub result: Option<Value>,
    pub failure_reason: Option<String>,
}

impl Job {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// How long a claim on this job holds before it counts as stalled.
    pub fn lease(&self) -> Duration {
        self.timeout().saturating_add(STALL_GRACE)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id.clone(),
            state: self.state,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            progress: self.progress,
            result: self.result.clone(),
            failure_reason: self.failure_reason.clone(),
        }
    }
}

/// A job as handed to the broker, before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub priority: Option<u32>,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    pub delay_ms: u64,
}

impl NewJob {
    pub fn into_job(self, id: String, queue: &str, created_at: DateTime<Utc>) -> Job {
        let state = if self.delay_ms > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        Job {
            id,
            queue: queue.to_string(),
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            attempts_made: 0,
            max_attempts: self.max_attempts,
            timeout_ms: self.timeout_ms,
            created_at,
            finished_at: None,
            state,
            progress: None,
            result: None,
            failure_reason: None,
        }
    }
}

/// Per-submission overrides of a queue's policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: Option<u32>,
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub delay: Option<Duration>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// What `get_status` reports back to producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub progress: Option<u8>,
    pub result: Option<Value>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: bool,
}

impl JobCounts {
    /// Jobs not yet finished; what backpressure compares against its threshold.
    pub fn depth(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }

    pub fn total(&self) -> u64 {
        self.depth() + self.completed + self.failed
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Epoch milliseconds `delay` after `now_ms`. Saturates rather than wrapping,
/// so an absurd delay means "never" instead of "now".
pub fn due_at_ms(now_ms: i64, delay: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
}

/// Jobs finished at or before the returned instant are older than `grace`.
/// `None` when `grace` reaches back past the representable range.
pub fn clean_cutoff(grace: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(grace)
        .ok()
        .and_then(|grace| Utc::now().checked_sub_signed(grace))
}
