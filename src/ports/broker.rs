use crate::domain::jobs::{Job, JobCounts, NewJob, TerminalState};
use crate::error::QueueError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Storage and dispatch operations of the underlying job broker.
///
/// Every state transition is atomic on the broker side: a job claimed by one
/// worker is never handed to another until it is retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Store a new job and assign it an id.
    async fn add(&self, queue: &str, job: NewJob) -> Result<Job, QueueError>;

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError>;

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError>;

    async fn pause(&self, queue: &str) -> Result<(), QueueError>;

    async fn resume(&self, queue: &str) -> Result<(), QueueError>;

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError>;

    /// Move the next due job to `active`. Returns `None` when the queue is
    /// empty or paused.
    async fn claim(&self, queue: &str) -> Result<Option<Job>, QueueError>;

    async fn update_progress(&self, queue: &str, id: &str, progress: u8)
        -> Result<(), QueueError>;

    /// Finish an active job successfully, keeping at most `retain` completed jobs.
    async fn complete(
        &self,
        queue: &str,
        id: &str,
        result: Value,
        retain: usize,
    ) -> Result<(), QueueError>;

    /// Count a failed attempt and schedule the job again after `delay`.
    async fn retry(
        &self,
        queue: &str,
        id: &str,
        reason: &str,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Count a failed attempt and move the job to terminal `failed`,
    /// keeping at most `retain` failed jobs.
    async fn fail(
        &self,
        queue: &str,
        id: &str,
        reason: &str,
        retain: usize,
    ) -> Result<(), QueueError>;

    /// Remove terminal jobs that finished more than `grace` ago. Returns the removed ids.
    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        state: TerminalState,
    ) -> Result<Vec<String>, QueueError>;

    async fn ping(&self) -> bool;
}
