use crate::domain::jobs::Job;
use crate::error::JobError;
use crate::ports::broker::JobBroker;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// What a handler gets for one attempt: the job and a way to report progress.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    broker: Arc<dyn JobBroker>,
}

impl JobContext {
    pub fn new(job: Job, broker: Arc<dyn JobBroker>) -> Self {
        Self { job, broker }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// 1-based number of the attempt in progress.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made + 1
    }

    /// Record progress (clamped to 100). Failures are logged, not returned:
    /// progress is informational and must not fail the attempt.
    pub async fn report_progress(&self, progress: u8) {
        let progress = progress.min(100);
        if let Err(e) = self
            .broker
            .update_progress(&self.job.queue, &self.job.id, progress)
            .await
        {
            warn!(queue = %self.job.queue, job_id = %self.job.id, error = %e, "progress update failed");
        }
    }
}

/// Executes one job family's work. Implemented outside this crate.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> Result<Value, JobError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<Value, JobError> {
        (self)(ctx).await
    }
}
