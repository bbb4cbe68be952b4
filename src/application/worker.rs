//! Bounded-concurrency workers, one per queue and handler.

use crate::adapters::events::{EventHub, JobEvent};
use crate::application::connection::{ReconnectPolicy, ReconnectState};
use crate::application::registry::QueueRegistry;
use crate::config::Config;
use crate::domain::families::JobFamily;
use crate::domain::jobs::Job;
use crate::domain::policy::QueuePolicy;
use crate::error::{JobError, QueueError};
use crate::ports::broker::JobBroker;
use crate::ports::handler::{JobContext, JobHandler};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const BROKER_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Jobs this worker runs at once.
    pub concurrency: usize,
    /// Wait between claims when the queue is empty or paused.
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// An outcome on its way to the broker.
enum Record<'a> {
    Complete(&'a Value),
    Retry { reason: &'a str, delay: Duration },
    Fail(&'a str),
}

/// What happened to a job after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { delay: Duration },
    Failed { reason: String },
}

pub struct Worker {
    queue: String,
    policy: QueuePolicy,
    broker: Arc<dyn JobBroker>,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    events: EventHub<JobEvent>,
}

impl Worker {
    pub fn new(
        queue: impl Into<String>,
        policy: QueuePolicy,
        broker: Arc<dyn JobBroker>,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
        events: EventHub<JobEvent>,
    ) -> Self {
        Self {
            queue: queue.into(),
            policy,
            broker,
            handler,
            options,
            events,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Claim and run jobs until `cancel` fires, then wait for in-flight jobs.
    ///
    /// A slot is reserved before claiming, so no more than `concurrency` jobs
    /// are ever active on behalf of this worker.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let in_flight = TaskTracker::new();
        info!(queue = %self.queue, concurrency = self.options.concurrency, "worker started");

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let idle = match self.broker.claim(&self.queue).await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    in_flight.spawn(async move {
                        let id = job.id.clone();
                        if let Err(e) = worker.process(job).await {
                            error!(queue = %worker.queue, job_id = %id, error = %e, "failed to record job outcome");
                        }
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => self.options.poll_interval,
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "claim failed");
                    BROKER_ERROR_PAUSE
                }
            };
            drop(permit);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }

        in_flight.close();
        if !in_flight.is_empty() {
            info!(queue = %self.queue, jobs = in_flight.len(), "waiting for in-flight jobs");
        }
        in_flight.wait().await;
        info!(queue = %self.queue, "worker stopped");
    }

    /// Run one attempt of a claimed job and record the outcome with the broker.
    pub async fn process(&self, job: Job) -> Result<JobOutcome, QueueError> {
        let attempt = job.attempts_made + 1;
        debug!(queue = %self.queue, job_id = %job.id, attempt, "job attempt started");

        let err = match self.attempt(&job).await {
            Ok(result) => {
                self.record(&job.id, Record::Complete(&result)).await?;
                info!(queue = %self.queue, job_id = %job.id, attempt, "job completed");
                self.events.publish(JobEvent::Completed {
                    queue: self.queue.clone(),
                    id: job.id,
                });
                return Ok(JobOutcome::Completed);
            }
            Err(err) => err,
        };

        let reason = err.to_string();
        if err.is_retryable() && attempt < job.max_attempts {
            let delay = self.policy.backoff.delay_for(job.attempts_made);
            self.record(
                &job.id,
                Record::Retry {
                    reason: &reason,
                    delay,
                },
            )
            .await?;
            warn!(
                queue = %self.queue,
                job_id = %job.id,
                attempt,
                max_attempts = job.max_attempts,
                ?delay,
                reason = %reason,
                "job attempt failed, retrying"
            );
            self.events.publish(JobEvent::Retrying {
                queue: self.queue.clone(),
                id: job.id,
                attempt,
                delay_ms: delay.as_millis() as u64,
                reason,
            });
            return Ok(JobOutcome::Retrying { delay });
        }

        self.record(&job.id, Record::Fail(&reason)).await?;
        error!(
            queue = %self.queue,
            job_id = %job.id,
            attempts_made = attempt,
            reason = %reason,
            "job failed"
        );
        self.events.publish(JobEvent::Failed {
            queue: self.queue.clone(),
            id: job.id,
            attempts_made: attempt,
            reason: reason.clone(),
        });
        Ok(JobOutcome::Failed { reason })
    }

    /// Write an outcome, retrying transient broker errors with the connection
    /// backoff. A claim that still cannot be settled is left for the broker to
    /// take back once its lease expires.
    async fn record(&self, id: &str, record: Record<'_>) -> Result<(), QueueError> {
        let mut backoff = ReconnectState::new(ReconnectPolicy::default());
        loop {
            let err = match self.write(id, &record).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            match backoff.record_failure() {
                Some(delay) if err.is_transient() => {
                    warn!(
                        queue = %self.queue,
                        job_id = %id,
                        attempt = backoff.failures(),
                        ?delay,
                        error = %err,
                        "recording job outcome failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(err),
            }
        }
    }

    async fn write(&self, id: &str, record: &Record<'_>) -> Result<(), QueueError> {
        match record {
            Record::Complete(result) => {
                self.broker
                    .complete(&self.queue, id, (*result).clone(), self.policy.retain_completed)
                    .await
            }
            Record::Retry { reason, delay } => {
                self.broker.retry(&self.queue, id, reason, *delay).await
            }
            Record::Fail(reason) => {
                self.broker
                    .fail(&self.queue, id, reason, self.policy.retain_failed)
                    .await
            }
        }
    }

    async fn attempt(&self, job: &Job) -> Result<Value, JobError> {
        let ctx = JobContext::new(job.clone(), self.broker.clone());
        let run = AssertUnwindSafe(self.handler.handle(ctx)).catch_unwind();
        match tokio::time::timeout(job.timeout(), run).await {
            Err(_) => Err(JobError::Timeout),
            Ok(Err(panic)) => Err(JobError::failed(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Ok(Ok(result)) => result,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// The workers of one process.
pub struct WorkerPool {
    registry: Arc<QueueRegistry>,
    events: EventHub<JobEvent>,
    cancel: CancellationToken,
    workers: TaskTracker,
}

impl WorkerPool {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self {
            registry,
            events: EventHub::new(),
            cancel: CancellationToken::new(),
            workers: TaskTracker::new(),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Start a worker running `handler` for every job claimed from `queue`.
    pub fn bind(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
    ) -> Result<(), QueueError> {
        let policy = self.registry.policy(queue)?;
        let worker = Arc::new(Worker::new(
            queue,
            policy,
            self.registry.broker(),
            handler,
            options,
            self.events.clone(),
        ));
        self.workers.spawn(worker.run(self.cancel.child_token()));
        Ok(())
    }

    /// Bind `handler` to `family`'s queue at that family's configured concurrency.
    pub fn bind_family(
        &self,
        family: JobFamily,
        handler: Arc<dyn JobHandler>,
        config: &Config,
    ) -> Result<(), QueueError> {
        self.bind(
            family.queue_name(),
            handler,
            config.family(family).worker_options(),
        )
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop claiming new jobs and wait for the ones already running.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.workers.close();
        self.workers.wait().await;
        info!("worker pool stopped");
    }
}
