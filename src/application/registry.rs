//! Named queues and their policies, over a shared [`JobBroker`].

use crate::domain::families::{JobFamily, JobPayload};
use crate::domain::jobs::{
    millis, Job, JobCounts, JobOptions, JobStatus, NewJob, TerminalState, MAX_PRIORITY,
};
use crate::domain::policy::QueuePolicy;
use crate::error::QueueError;
use crate::ports::broker::JobBroker;
use crate::ports::queue::QueueControl;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct QueueRegistry {
    broker: Arc<dyn JobBroker>,
    queues: RwLock<HashMap<String, QueuePolicy>>,
}

impl QueueRegistry {
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self {
            broker,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Register `name`. A second call keeps the policy of the first.
    pub fn create_queue(&self, name: &str, policy: QueuePolicy) {
        let mut queues = self.queues.write();
        if queues.contains_key(name) {
            debug!(queue = %name, "queue already registered");
            return;
        }
        info!(
            queue = %name,
            max_attempts = policy.max_attempts,
            timeout_ms = policy.timeout_ms,
            "queue registered"
        );
        queues.insert(name.to_string(), policy);
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn policy(&self, queue: &str) -> Result<QueuePolicy, QueueError> {
        self.queues
            .read()
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    pub fn broker(&self) -> Arc<dyn JobBroker> {
        self.broker.clone()
    }

    /// Enqueue a job. Paused queues still accept work; it waits broker-side.
    ///
    /// Payloads for a job family's queue must match that family's shape.
    pub async fn submit(
        &self,
        queue: &str,
        job_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        let policy = self.policy(queue)?;
        if payload.is_null() {
            return Err(QueueError::PayloadRejected("payload is missing".into()));
        }
        if job_type.trim().is_empty() {
            return Err(QueueError::PayloadRejected("job type is missing".into()));
        }
        if let Some(family) = JobFamily::from_queue_name(queue) {
            family
                .check_payload(&payload)
                .map_err(QueueError::PayloadRejected)?;
        }

        let new_job = NewJob {
            job_type: job_type.to_string(),
            payload,
            priority: options.priority.map(|p| p.min(MAX_PRIORITY)),
            max_attempts: options.max_attempts.unwrap_or(policy.max_attempts).max(1),
            timeout_ms: options.timeout.map(millis).unwrap_or(policy.timeout_ms),
            delay_ms: options.delay.map(millis).unwrap_or(0),
        };
        let job = self.broker.add(queue, new_job).await?;
        debug!(queue = %queue, job_id = %job.id, job_type = %job.job_type, "job submitted");
        Ok(job)
    }

    /// Validate and enqueue a typed payload on its family's queue.
    pub async fn submit_payload<P: JobPayload>(
        &self,
        payload: &P,
        options: JobOptions,
    ) -> Result<Job, QueueError> {
        payload.validate().map_err(QueueError::PayloadRejected)?;
        let value = serde_json::to_value(payload)?;
        self.submit(P::FAMILY.queue_name(), payload.job_type(), value, options)
            .await
    }

    pub async fn get_status(&self, queue: &str, id: &str) -> Result<JobStatus, QueueError> {
        self.policy(queue)?;
        self.broker
            .get(queue, id)
            .await?
            .map(|job| job.status())
            .ok_or_else(|| QueueError::job_not_found(queue, id))
    }

    pub async fn get_stats(&self, queue: &str) -> Result<JobCounts, QueueError> {
        self.policy(queue)?;
        self.broker.counts(queue).await
    }

    /// Counts for every queue. Queues that cannot be read are logged and left
    /// out; the call fails only when none could be read.
    pub async fn all_stats(&self) -> Result<BTreeMap<String, JobCounts>, QueueError> {
        let mut stats = BTreeMap::new();
        let mut last_error = None;
        for name in self.queue_names() {
            match self.broker.counts(&name).await {
                Ok(counts) => {
                    stats.insert(name, counts);
                }
                Err(e) => {
                    warn!(queue = %name, error = %e, "queue stats unavailable, skipping");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if stats.is_empty() => Err(e),
            _ => Ok(stats),
        }
    }

    pub async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        self.policy(queue)?;
        self.broker.pause(queue).await?;
        info!(queue = %queue, "queue paused");
        Ok(())
    }

    pub async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        self.policy(queue)?;
        self.broker.resume(queue).await?;
        info!(queue = %queue, "queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        self.policy(queue)?;
        self.broker.is_paused(queue).await
    }

    /// Remove `state` jobs that finished more than `older_than` ago.
    pub async fn clean(
        &self,
        queue: &str,
        older_than: Duration,
        state: TerminalState,
    ) -> Result<Vec<String>, QueueError> {
        self.policy(queue)?;
        let removed = self.broker.clean(queue, older_than, state).await?;
        info!(queue = %queue, ?state, removed = removed.len(), "queue cleaned");
        Ok(removed)
    }

    pub async fn ping(&self) -> bool {
        self.broker.ping().await
    }
}

#[async_trait]
impl QueueControl for QueueRegistry {
    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        Ok(self.get_stats(queue).await?.depth())
    }

    async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        QueueRegistry::pause(self, queue).await
    }

    async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        QueueRegistry::resume(self, queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryBroker;
    use crate::error::ConnectionError;
    use crate::domain::families::{AudioConvert, Email};
    use crate::domain::jobs::JobState;
    use crate::ports::broker::MockJobBroker;
    use serde_json::json;

    fn registry() -> QueueRegistry {
        let registry = QueueRegistry::new(Arc::new(MemoryBroker::new()));
        registry.create_queue("reports", QueuePolicy::default());
        registry
    }

    #[tokio::test]
    async fn test_submit_to_unknown_queue() {
        let registry = registry();
        let err = registry
            .submit("nope", "send", json!({}), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_missing_payload_is_rejected() {
        let registry = registry();
        let err = registry
            .submit("reports", "send", Value::Null, JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::PayloadRejected(_)));
    }

    #[tokio::test]
    async fn test_options_override_policy() {
        let registry = registry();
        let job = registry
            .submit(
                "reports",
                "send",
                json!({"to": "a@b.c"}),
                JobOptions::default()
                    .with_timeout(Duration::from_millis(250))
                    .with_priority(u32::MAX),
            )
            .await
            .unwrap();

        assert_eq!(job.timeout_ms, 250);
        assert_eq!(job.max_attempts, QueuePolicy::default().max_attempts);
        assert_eq!(job.priority, Some(MAX_PRIORITY));
    }

    #[tokio::test]
    async fn test_create_queue_keeps_first_policy() {
        let registry = registry();
        registry.create_queue(
            "reports",
            QueuePolicy {
                max_attempts: 9,
                ..QueuePolicy::default()
            },
        );
        assert_eq!(registry.policy("reports").unwrap().max_attempts, 3);
        assert_eq!(registry.queue_names(), vec!["reports".to_string()]);
    }

    #[tokio::test]
    async fn test_status_of_unknown_job() {
        let registry = registry();
        let err = registry.get_status("reports", "404").await.unwrap_err();
        assert!(matches!(err, QueueError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_stats_sum_matches_submissions_minus_cleaned() {
        let registry = registry();
        let broker = registry.broker();
        for n in 0..6 {
            registry
                .submit("reports", "send", json!({ "n": n }), JobOptions::default())
                .await
                .unwrap();
        }

        let first = broker.claim("reports").await.unwrap().unwrap();
        broker
            .complete("reports", &first.id, json!("ok"), 100)
            .await
            .unwrap();
        let second = broker.claim("reports").await.unwrap().unwrap();
        broker.fail("reports", &second.id, "boom", 100).await.unwrap();
        broker.claim("reports").await.unwrap().unwrap();

        let stats = registry.get_stats("reports").await.unwrap();
        assert_eq!(stats.waiting, 3);
        assert_eq!(stats.active, 1);
        assert_eq!(
            stats.waiting + stats.active + stats.completed + stats.failed,
            6
        );

        let removed = registry
            .clean("reports", Duration::ZERO, TerminalState::Completed)
            .await
            .unwrap();
        assert_eq!(removed, vec![first.id.clone()]);
        let stats = registry.get_stats("reports").await.unwrap();
        assert_eq!(stats.total(), 5);
        assert_eq!(
            registry.get_status("reports", &second.id).await.unwrap().state,
            JobState::Failed
        );
    }

    #[tokio::test]
    async fn test_pause_and_resume_are_idempotent() {
        let registry = registry();
        registry.pause("reports").await.unwrap();
        registry.pause("reports").await.unwrap();
        assert!(registry.is_paused("reports").await.unwrap());

        let job = registry
            .submit("reports", "send", json!({}), JobOptions::default())
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert!(registry.broker().claim("reports").await.unwrap().is_none());

        registry.resume("reports").await.unwrap();
        registry.resume("reports").await.unwrap();
        assert!(!registry.is_paused("reports").await.unwrap());
        assert!(registry.broker().claim("reports").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_typed_payloads_land_on_their_family_queue() {
        let registry = registry();
        registry.create_queue("audio-convert", QueuePolicy::default());

        let job = registry
            .submit_payload(
                &AudioConvert {
                    source_key: "uploads/a.wav".into(),
                    target_format: "mp3".into(),
                    bitrate_kbps: Some(192),
                },
                JobOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(job.queue, "audio-convert");
        assert_eq!(job.job_type, "convert");

        let err = registry
            .submit_payload(
                &Email {
                    to: String::new(),
                    template: "welcome".into(),
                    variables: Default::default(),
                },
                JobOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::PayloadRejected(_)));
    }

    #[tokio::test]
    async fn test_family_queues_check_payload_shape() {
        let registry = registry();
        for family in JobFamily::ALL {
            registry.create_queue(family.queue_name(), family.default_policy());
        }

        let err = registry
            .submit("email", "send", json!({"garbage": 1}), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::PayloadRejected(_)));

        let err = registry
            .submit(
                "audio-mix",
                "mix",
                json!({"track_keys": ["solo.wav"], "output_key": "out.wav"}),
                JobOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::PayloadRejected(reason) if reason.contains("two tracks")));

        let job = registry
            .submit(
                "email",
                "send",
                json!({"to": "ops@example.com", "template": "welcome"}),
                JobOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(job.queue, "email");

        registry
            .submit("reports", "render", json!({"garbage": 1}), JobOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_all_stats_skips_unreadable_queues() {
        let mut broker = MockJobBroker::new();
        broker.expect_counts().returning(|queue| {
            if queue == "email" {
                Err(QueueError::Broker {
                    message: "timeout".into(),
                    transient: true,
                })
            } else {
                Ok(JobCounts {
                    waiting: 4,
                    ..JobCounts::default()
                })
            }
        });
        let registry = QueueRegistry::new(Arc::new(broker));
        registry.create_queue("email", QueuePolicy::default());
        registry.create_queue("analytics", QueuePolicy::default());

        let stats = registry.all_stats().await.unwrap();
        assert_eq!(stats.keys().collect::<Vec<_>>(), vec!["analytics"]);
        assert_eq!(stats["analytics"].waiting, 4);
    }

    #[tokio::test]
    async fn test_all_stats_fails_when_nothing_is_readable() {
        let mut broker = MockJobBroker::new();
        broker
            .expect_counts()
            .returning(|_| Err(QueueError::ConnectionUnavailable(ConnectionError::Unconfigured)));
        let registry = QueueRegistry::new(Arc::new(broker));
        registry.create_queue("email", QueuePolicy::default());

        assert!(matches!(
            registry.all_stats().await,
            Err(QueueError::ConnectionUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_huge_delay_stays_delayed() {
        let registry = registry();
        let job = registry
            .submit(
                "reports",
                "render",
                json!({}),
                JobOptions::default().with_delay(Duration::MAX),
            )
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert!(registry.broker().claim("reports").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_depth_counts_unfinished_work() {
        let registry = registry();
        registry
            .submit(
                "reports",
                "send",
                json!({}),
                JobOptions::default().with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        registry
            .submit("reports", "send", json!({}), JobOptions::default())
            .await
            .unwrap();
        assert_eq!(QueueControl::depth(&registry, "reports").await.unwrap(), 2);
    }
}
