//! In-process broker.
//!
//! Keeps every queue in one mutex-guarded map, so each operation is atomic
//! with respect to every other. Suitable for tests and single-process
//! deployments (`memory://`); jobs do not survive a restart.

use crate::domain::jobs::{
    clean_cutoff, Job, JobCounts, JobState, NewJob, TerminalState, STALLED_REASON,
};
use crate::error::QueueError;
use crate::ports::broker::JobBroker;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Stand-in for "never" when a delay overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn due_at(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or(now + FAR_FUTURE)
}

#[derive(Default)]
struct QueueState {
    paused: bool,
    jobs: HashMap<String, Job>,
    /// (priority, insertion sequence, id): lowest priority value first, FIFO within a priority.
    waiting: BTreeSet<(u32, u64, String)>,
    delayed: Vec<(Instant, String)>,
    /// Claimed jobs and the instant their lease runs out.
    active: HashMap<String, Instant>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    sequence: u64,
}

impl QueueState {
    fn enqueue(&mut self, id: String, priority: Option<u32>) {
        self.sequence += 1;
        self.waiting
            .insert((priority.unwrap_or(0), self.sequence, id));
    }

    /// Take back claims whose lease ran out, counting the lost attempt.
    fn recover_stalled(&mut self, queue: &str, now: Instant) {
        let stalled: Vec<String> = self
            .active
            .iter()
            .filter(|(_, lease)| **lease <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stalled {
            self.active.remove(&id);
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            job.attempts_made += 1;
            job.failure_reason = Some(STALLED_REASON.to_string());
            warn!(queue, job_id = %id, attempts_made = job.attempts_made, "recovered stalled job");
            if job.attempts_made >= job.max_attempts {
                job.state = JobState::Failed;
                job.finished_at = Some(Utc::now());
                self.failed.push_back(id);
            } else {
                job.state = JobState::Delayed;
                self.delayed.push((now, id));
            }
        }
    }

    fn promote_due(&mut self, queue: &str, now: Instant) {
        self.recover_stalled(queue, now);
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(ready_at, _)| *ready_at <= now);
        self.delayed = pending;
        for (_, id) in due {
            let priority = match self.jobs.get_mut(&id) {
                Some(job) => {
                    job.state = JobState::Waiting;
                    job.priority
                }
                None => continue,
            };
            self.enqueue(id, priority);
        }
    }

    fn take_active(&mut self, queue: &str, id: &str) -> Result<&mut Job, QueueError> {
        if self.active.remove(id).is_none() {
            return Err(QueueError::job_not_found(queue, id));
        }
        self.jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::job_not_found(queue, id))
    }

    /// Append to a terminal ring buffer, evicting the oldest entries beyond `retain`.
    fn retire(&mut self, state: TerminalState, id: &str, retain: usize) {
        let ring = match state {
            TerminalState::Completed => &mut self.completed,
            TerminalState::Failed => &mut self.failed,
        };
        ring.push_back(id.to_string());
        let mut evicted = Vec::new();
        while ring.len() > retain {
            if let Some(old) = ring.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            self.jobs.remove(&old);
        }
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    next_id: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn add(&self, queue: &str, job: NewJob) -> Result<Job, QueueError> {
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let delay = Duration::from_millis(job.delay_ms);
        let job = job.into_job(id.clone(), queue, Utc::now());

        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        if job.state == JobState::Delayed {
            state.delayed.push((due_at(Instant::now(), delay), id.clone()));
        } else {
            state.enqueue(id.clone(), job.priority);
        }
        state.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError> {
        let queues = self.queues.lock();
        Ok(queues.get(queue).and_then(|state| state.jobs.get(id)).cloned())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(JobCounts::default());
        };
        state.promote_due(queue, Instant::now());
        Ok(JobCounts {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            delayed: state.delayed.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
            paused: state.paused,
        })
    }

    async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        self.queues.lock().entry(queue.to_string()).or_default().paused = true;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        self.queues.lock().entry(queue.to_string()).or_default().paused = false;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        Ok(self
            .queues
            .lock()
            .get(queue)
            .map(|state| state.paused)
            .unwrap_or(false))
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        if state.paused {
            return Ok(None);
        }
        let now = Instant::now();
        state.promote_due(queue, now);

        while let Some((_, _, id)) = state.waiting.pop_first() {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.state = JobState::Active;
                let claimed = job.clone();
                state.active.insert(id, due_at(now, claimed.lease()));
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: u8,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock();
        let job = queues
            .get_mut(queue)
            .and_then(|state| state.jobs.get_mut(id))
            .ok_or_else(|| QueueError::job_not_found(queue, id))?;
        job.progress = Some(progress);
        Ok(())
    }

    async fn complete(
        &self,
        queue: &str,
        id: &str,
        result: Value,
        retain: usize,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::job_not_found(queue, id))?;
        let job = state.take_active(queue, id)?;
        job.attempts_made += 1;
        job.state = JobState::Completed;
        job.result = Some(result);
        job.finished_at = Some(Utc::now());
        state.retire(TerminalState::Completed, id, retain);
        Ok(())
    }

    async fn retry(
        &self,
        queue: &str,
        id: &str,
        reason: &str,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::job_not_found(queue, id))?;
        let job = state.take_active(queue, id)?;
        job.attempts_made += 1;
        job.state = JobState::Delayed;
        job.failure_reason = Some(reason.to_string());
        state.delayed.push((due_at(Instant::now(), delay), id.to_string()));
        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        id: &str,
        reason: &str,
        retain: usize,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::job_not_found(queue, id))?;
        let job = state.take_active(queue, id)?;
        job.attempts_made += 1;
        job.state = JobState::Failed;
        job.failure_reason = Some(reason.to_string());
        job.finished_at = Some(Utc::now());
        state.retire(TerminalState::Failed, id, retain);
        Ok(())
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        target: TerminalState,
    ) -> Result<Vec<String>, QueueError> {
        let Some(cutoff) = clean_cutoff(grace) else {
            return Ok(Vec::new());
        };
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let QueueState {
            jobs,
            completed,
            failed,
            ..
        } = state;
        let ring = match target {
            TerminalState::Completed => completed,
            TerminalState::Failed => failed,
        };
        let mut removed = Vec::new();
        ring.retain(|id| {
            let expired = jobs
                .get(id)
                .and_then(|job| job.finished_at)
                .map(|finished| finished <= cutoff)
                .unwrap_or(true);
            if expired {
                removed.push(id.clone());
            }
            !expired
        });
        for id in &removed {
            jobs.remove(id);
        }
        Ok(removed)
    }

    async fn ping(&self) -> bool {
        true
    }
}
