//! Redis JobBroker implementation.

use super::connection::RedisConnectionFactory;
use super::error::is_transient;
use super::scripts::{wait_score, Scripts};
use crate::application::connection::ConnectionBroker;
use crate::domain::jobs::{
    clean_cutoff, due_at_ms, millis, Job, JobCounts, JobState, NewJob, TerminalState,
    MAX_PRIORITY, STALLED_REASON, STALL_GRACE,
};
use crate::error::{ConnectionError, QueueError};
use crate::ports::broker::JobBroker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult, Script, ScriptInvocation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type RedisConnections = ConnectionBroker<RedisConnectionFactory>;

/// The immutable part of a job, stored as JSON in the `data` hash field.
#[derive(Debug, Serialize, Deserialize)]
struct JobData {
    job_type: String,
    payload: Value,
    priority: Option<u32>,
    max_attempts: u32,
    timeout_ms: u64,
    created_at: DateTime<Utc>,
}

/// Redis-backed broker. Every command goes over the shared primary connection.
#[derive(Clone)]
pub struct RedisBroker {
    connections: Arc<RedisConnections>,
    prefix: String,
    scripts: Arc<Scripts>,
}

impl RedisBroker {
    pub fn new(connections: Arc<RedisConnections>, prefix: impl Into<String>) -> Self {
        Self {
            connections,
            prefix: prefix.into(),
            scripts: Arc::new(Scripts::new()),
        }
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, suffix)
    }

    fn job_prefix(&self, queue: &str) -> String {
        self.key(queue, "job:")
    }

    fn ring(&self, queue: &str, state: TerminalState) -> String {
        match state {
            TerminalState::Completed => self.key(queue, "completed"),
            TerminalState::Failed => self.key(queue, "failed"),
        }
    }

    async fn conn(&self) -> Result<MultiplexedConnection, QueueError> {
        Ok(self.connections.primary().await?.commands())
    }

    /// Converts a Redis result, dropping the primary connection on transient errors.
    async fn observe<T>(&self, result: RedisResult<T>) -> Result<T, QueueError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if is_transient(&err) {
                    self.connections
                        .report_error(&ConnectionError::Transient(err.to_string()))
                        .await;
                }
                Err(QueueError::from(err))
            }
        }
    }

    /// Binds the keys and arguments shared by the maintenance and claim scripts.
    fn queue_script<'a>(&self, script: &'a Script, queue: &str) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.key(queue, "wait"))
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "active"))
            .key(self.key(queue, "paused"))
            .key(self.key(queue, "failed"))
            .arg(Utc::now().timestamp_millis())
            .arg(self.job_prefix(queue))
            .arg(STALLED_REASON)
            .arg(millis(STALL_GRACE));
        invocation
    }

    /// Takes back stalled jobs and promotes due delayed ones.
    async fn maintain(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
    ) -> Result<(), QueueError> {
        let result: RedisResult<()> = self
            .queue_script(&self.scripts.maintain, queue)
            .invoke_async(conn)
            .await;
        self.observe(result).await
    }
}

fn decode_job(queue: &str, id: &str, fields: &HashMap<String, String>) -> Result<Job, QueueError> {
    let field = |name: &str| fields.get(name).map(String::as_str);
    let corrupt = |what: &str| QueueError::Broker {
        message: format!("job {} in {} has a corrupt {} field", id, queue, what),
        transient: false,
    };

    let data: JobData = serde_json::from_str(field("data").ok_or_else(|| corrupt("data"))?)?;
    let state: JobState = field("state")
        .ok_or_else(|| corrupt("state"))?
        .parse()
        .map_err(|_| corrupt("state"))?;
    let attempts_made = field("attempts")
        .unwrap_or("0")
        .parse()
        .map_err(|_| corrupt("attempts"))?;
    let progress = field("progress").and_then(|p| p.parse().ok());
    let finished_at = field("finished_at")
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis);
    let result = match field("result") {
        Some(raw) => Some(serde_json::from_str(raw)?),
        None => None,
    };

    Ok(Job {
        id: id.to_string(),
        queue: queue.to_string(),
        job_type: data.job_type,
        payload: data.payload,
        priority: data.priority,
        attempts_made,
        max_attempts: data.max_attempts,
        timeout_ms: data.timeout_ms,
        created_at: data.created_at,
        finished_at,
        state,
        progress,
        result,
        failure_reason: field("reason").map(str::to_string),
    })
}

#[async_trait]
impl JobBroker for RedisBroker {
    async fn add(&self, queue: &str, job: NewJob) -> Result<Job, QueueError> {
        let mut conn = self.conn().await?;
        let id: u64 = self.observe(conn.incr(self.key(queue, "id"), 1u64).await).await?;

        let priority = job.priority.map(|p| p.min(MAX_PRIORITY));
        let delay_ms = job.delay_ms;
        let job = NewJob { priority, ..job }.into_job(id.to_string(), queue, Utc::now());
        let data = serde_json::to_string(&JobData {
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            priority: job.priority,
            max_attempts: job.max_attempts,
            timeout_ms: job.timeout_ms,
            created_at: job.created_at,
        })?;

        let job_key = format!("{}{}", self.job_prefix(queue), job.id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(
                &job_key,
                &[
                    ("data", data),
                    ("state", job.state.as_str().to_string()),
                    ("attempts", "0".to_string()),
                    ("priority", priority.unwrap_or(0).to_string()),
                    ("max_attempts", job.max_attempts.to_string()),
                    ("lease_ms", millis(job.lease()).to_string()),
                ],
            )
            .ignore();
        if job.state == JobState::Delayed {
            let ready_at = due_at_ms(
                Utc::now().timestamp_millis(),
                Duration::from_millis(delay_ms),
            );
            pipe.zadd(self.key(queue, "delayed"), &job.id, ready_at)
                .ignore();
        } else {
            pipe.zadd(self.key(queue, "wait"), &job.id, wait_score(priority, id))
                .ignore();
        }
        let stored: RedisResult<()> = pipe.query_async(&mut conn).await;
        self.observe(stored).await?;
        Ok(job)
    }

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn().await?;
        let key = format!("{}{}", self.job_prefix(queue), id);
        let fields: HashMap<String, String> = self.observe(conn.hgetall(&key).await).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(queue, id, &fields).map(Some)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let mut conn = self.conn().await?;
        self.maintain(&mut conn, queue).await?;

        let counted: RedisResult<(u64, u64, u64, u64, u64, bool)> = redis::pipe()
            .zcard(self.key(queue, "wait"))
            .zcard(self.key(queue, "active"))
            .zcard(self.key(queue, "delayed"))
            .zcard(self.key(queue, "completed"))
            .zcard(self.key(queue, "failed"))
            .exists(self.key(queue, "paused"))
            .query_async(&mut conn)
            .await;
        let (waiting, active, delayed, completed, failed, paused) = self.observe(counted).await?;
        Ok(JobCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
            paused,
        })
    }

    async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let result: RedisResult<()> = conn.set(self.key(queue, "paused"), 1).await;
        self.observe(result).await
    }

    async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let result: RedisResult<()> = conn.del(self.key(queue, "paused")).await;
        self.observe(result).await
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        self.observe(conn.exists(self.key(queue, "paused")).await)
            .await
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn().await?;
        let claimed: RedisResult<Option<String>> = self
            .queue_script(&self.scripts.claim, queue)
            .invoke_async(&mut conn)
            .await;
        match self.observe(claimed).await? {
            Some(id) => self.get(queue, &id).await,
            None => Ok(None),
        }
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: u8,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let key = format!("{}{}", self.job_prefix(queue), id);
        let exists: bool = self.observe(conn.exists(&key).await).await?;
        if !exists {
            return Err(QueueError::job_not_found(queue, id));
        }
        let result: RedisResult<()> = conn.hset(&key, "progress", progress).await;
        self.observe(result).await
    }

    async fn complete(
        &self,
        queue: &str,
        id: &str,
        result: Value,
        retain: usize,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let encoded = serde_json::to_string(&result)?;
        let moved: RedisResult<i64> = self
            .scripts
            .finish
            .key(self.key(queue, "active"))
            .key(self.ring(queue, TerminalState::Completed))
            .arg(self.job_prefix(queue))
            .arg(id)
            .arg(JobState::Completed.as_str())
            .arg(Utc::now().timestamp_millis())
            .arg("result")
            .arg(encoded)
            .arg(retain)
            .invoke_async(&mut conn)
            .await;
        match self.observe(moved).await? {
            1 => Ok(()),
            _ => Err(QueueError::job_not_found(queue, id)),
        }
    }

    async fn retry(
        &self,
        queue: &str,
        id: &str,
        reason: &str,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let ready_at = due_at_ms(Utc::now().timestamp_millis(), delay);
        let moved: RedisResult<i64> = self
            .scripts
            .retry
            .key(self.key(queue, "active"))
            .key(self.key(queue, "delayed"))
            .arg(self.job_prefix(queue))
            .arg(id)
            .arg(ready_at)
            .arg(reason)
            .invoke_async(&mut conn)
            .await;
        match self.observe(moved).await? {
            1 => Ok(()),
            _ => Err(QueueError::job_not_found(queue, id)),
        }
    }

    async fn fail(
        &self,
        queue: &str,
        id: &str,
        reason: &str,
        retain: usize,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let moved: RedisResult<i64> = self
            .scripts
            .finish
            .key(self.key(queue, "active"))
            .key(self.ring(queue, TerminalState::Failed))
            .arg(self.job_prefix(queue))
            .arg(id)
            .arg(JobState::Failed.as_str())
            .arg(Utc::now().timestamp_millis())
            .arg("reason")
            .arg(reason)
            .arg(retain)
            .invoke_async(&mut conn)
            .await;
        match self.observe(moved).await? {
            1 => Ok(()),
            _ => Err(QueueError::job_not_found(queue, id)),
        }
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        state: TerminalState,
    ) -> Result<Vec<String>, QueueError> {
        let Some(cutoff) = clean_cutoff(grace) else {
            return Ok(Vec::new());
        };
        let mut conn = self.conn().await?;
        let removed: RedisResult<Vec<String>> = self
            .scripts
            .clean
            .key(self.ring(queue, state))
            .arg(self.job_prefix(queue))
            .arg(cutoff.timestamp_millis())
            .invoke_async(&mut conn)
            .await;
        self.observe(removed).await
    }

    async fn ping(&self) -> bool {
        self.connections.health_check().await
    }
}
