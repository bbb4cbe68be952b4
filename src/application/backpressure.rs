//! Process-wide admission control.
//!
//! A periodic poll samples process memory and the depth of every registered
//! queue. Crossing a threshold pauses all registered queues; a later poll
//! that finds everything clear resumes them. Only the transitions are acted
//! on, so a sustained overload pauses once and emits one event. Queues whose
//! pause or resume failed are retried on every later poll until it sticks.

use crate::adapters::events::EventHub;
use crate::domain::backpressure::{BackpressureEvent, BackpressureReason, BackpressureStatus};
use crate::ports::queue::{MemorySampler, QueueControl};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureConfig {
    /// Depth (waiting + active + delayed) above which a single queue triggers.
    pub max_queue_size: u64,
    pub max_memory_mb: f64,
    pub check_interval: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_memory_mb: 1200.0,
            check_interval: Duration::from_secs(30),
        }
    }
}

enum Verdict {
    Overloaded(BackpressureReason),
    Clear,
}

pub struct BackpressureManager {
    config: BackpressureConfig,
    queues: Arc<dyn QueueControl>,
    memory: Arc<dyn MemorySampler>,
    registered: RwLock<Vec<String>>,
    status: Mutex<BackpressureStatus>,
    /// Queues not yet brought in line with the current state.
    pending: Mutex<HashSet<String>>,
    /// Serialises polls and manual overrides.
    transitions: tokio::sync::Mutex<()>,
    events: EventHub<BackpressureEvent>,
}

impl BackpressureManager {
    pub fn new(
        config: BackpressureConfig,
        queues: Arc<dyn QueueControl>,
        memory: Arc<dyn MemorySampler>,
    ) -> Self {
        Self {
            config,
            queues,
            memory,
            registered: RwLock::new(Vec::new()),
            status: Mutex::new(BackpressureStatus::normal()),
            pending: Mutex::new(HashSet::new()),
            transitions: tokio::sync::Mutex::new(()),
            events: EventHub::new(),
        }
    }

    pub fn config(&self) -> BackpressureConfig {
        self.config
    }

    /// Observe `queue` from the next poll on. Registering twice is a no-op.
    pub fn register(&self, queue: impl Into<String>) {
        let queue = queue.into();
        let mut registered = self.registered.write();
        if !registered.contains(&queue) {
            debug!(queue = %queue, "queue registered for backpressure");
            registered.push(queue);
        }
    }

    pub fn registered(&self) -> Vec<String> {
        self.registered.read().clone()
    }

    /// The current snapshot, independent of the poll cadence.
    pub fn status(&self) -> BackpressureStatus {
        self.status.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.status.lock().active
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackpressureEvent> {
        self.events.subscribe()
    }

    /// Run one sampling cycle and apply any resulting transition.
    pub async fn poll_once(&self) -> BackpressureStatus {
        let _serial = self.transitions.lock().await;
        self.settle_pending().await;
        let current = self.status();
        if current.active && current.reason == BackpressureReason::Manual {
            debug!("manual backpressure in effect, skipping automatic checks");
            return current;
        }

        let memory_mb = self.sample_memory();
        let (verdict, depth) = if memory_mb > self.config.max_memory_mb {
            (
                Verdict::Overloaded(BackpressureReason::MemoryLimit),
                current.sampled_queue_depth,
            )
        } else {
            self.check_queues().await
        };

        match verdict {
            Verdict::Overloaded(reason) => self.activate(reason, memory_mb, depth).await,
            Verdict::Clear if current.active => self.deactivate(memory_mb, depth).await,
            Verdict::Clear => self.record_sample(memory_mb, depth),
        }
    }

    /// Activate with reason `manual`. Only [`release_backpressure`] clears it.
    ///
    /// [`release_backpressure`]: Self::release_backpressure
    pub async fn force_backpressure(&self) -> BackpressureStatus {
        let _serial = self.transitions.lock().await;
        let memory_mb = self.sample_memory();
        let depth = {
            let mut status = self.status.lock();
            if status.active {
                if status.reason != BackpressureReason::Manual {
                    info!(previous = ?status.reason, "backpressure pinned manually");
                    status.reason = BackpressureReason::Manual;
                    status.timestamp = Utc::now();
                }
                return status.clone();
            }
            status.sampled_queue_depth
        };
        self.activate(BackpressureReason::Manual, memory_mb, depth)
            .await
    }

    /// Clear backpressure whatever activated it. The next poll re-evaluates
    /// the thresholds from scratch.
    pub async fn release_backpressure(&self) -> BackpressureStatus {
        let _serial = self.transitions.lock().await;
        let current = self.status();
        if !current.active {
            return current;
        }
        self.deactivate(self.sample_memory(), current.sampled_queue_depth)
            .await
    }

    /// Poll every `check_interval` until `cancel` fires. The first poll runs
    /// one interval after starting.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.config.check_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                ?period,
                max_queue_size = self.config.max_queue_size,
                max_memory_mb = self.config.max_memory_mb,
                "backpressure monitor started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                }
            }
            info!("backpressure monitor stopped");
        })
    }

    fn sample_memory(&self) -> f64 {
        match self.memory.used_mb() {
            Some(mb) => mb,
            None => {
                warn!("memory sample unavailable");
                0.0
            }
        }
    }

    /// Returns the verdict and the deepest queue seen.
    async fn check_queues(&self) -> (Verdict, u64) {
        let mut deepest = 0;
        for queue in self.registered() {
            let depth = match self.queues.depth(&queue).await {
                Ok(depth) => depth,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "queue depth unavailable, skipping");
                    continue;
                }
            };
            deepest = deepest.max(depth);
            if depth > self.config.max_queue_size {
                debug!(queue = %queue, depth, "queue over depth threshold");
                return (Verdict::Overloaded(BackpressureReason::QueueDepth), depth);
            }
        }
        (Verdict::Clear, deepest)
    }

    fn record_sample(&self, memory_mb: f64, depth: u64) -> BackpressureStatus {
        let mut status = self.status.lock();
        status.sampled_memory_mb = memory_mb;
        status.sampled_queue_depth = depth;
        status.clone()
    }

    async fn activate(
        &self,
        reason: BackpressureReason,
        memory_mb: f64,
        depth: u64,
    ) -> BackpressureStatus {
        if self.is_active() {
            return self.record_sample(memory_mb, depth);
        }

        let status = BackpressureStatus {
            active: true,
            reason,
            sampled_memory_mb: memory_mb,
            sampled_queue_depth: depth,
            timestamp: Utc::now(),
        };
        *self.status.lock() = status.clone();
        warn!(?reason, memory_mb, depth, "backpressure activated");

        let failed = self.apply(self.registered(), true).await;
        *self.pending.lock() = failed;
        self.events
            .publish(BackpressureEvent::Activated(status.clone()));
        status
    }

    /// Pause or resume each of `queues`, returning the ones that failed.
    async fn apply(&self, queues: Vec<String>, pause: bool) -> HashSet<String> {
        let mut failed = HashSet::new();
        for queue in queues {
            let result = if pause {
                self.queues.pause(&queue).await
            } else {
                self.queues.resume(&queue).await
            };
            if let Err(e) = result {
                warn!(queue = %queue, pause, error = %e, "failed to apply backpressure to queue");
                failed.insert(queue);
            }
        }
        failed
    }

    /// Retry the queues a previous transition could not reach.
    async fn settle_pending(&self) {
        let pending: Vec<String> = self.pending.lock().drain().collect();
        if pending.is_empty() {
            return;
        }
        let pause = self.is_active();
        debug!(queues = pending.len(), pause, "retrying queues left behind by a transition");
        let failed = self.apply(pending, pause).await;
        *self.pending.lock() = failed;
    }

    async fn deactivate(&self, memory_mb: f64, depth: u64) -> BackpressureStatus {
        let status = BackpressureStatus {
            sampled_memory_mb: memory_mb,
            sampled_queue_depth: depth,
            ..BackpressureStatus::normal()
        };
        *self.status.lock() = status.clone();
        info!(memory_mb, depth, "backpressure deactivated");

        let failed = self.apply(self.registered(), false).await;
        *self.pending.lock() = failed;
        self.events
            .publish(BackpressureEvent::Deactivated(status.clone()));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::ports::queue::{MockMemorySampler, MockQueueControl};

    fn config(max_queue_size: u64, max_memory_mb: f64) -> BackpressureConfig {
        BackpressureConfig {
            max_queue_size,
            max_memory_mb,
            check_interval: Duration::from_secs(30),
        }
    }

    fn memory(mb: Arc<Mutex<f64>>) -> Arc<dyn MemorySampler> {
        let mut sampler = MockMemorySampler::new();
        sampler.expect_used_mb().returning(move || Some(*mb.lock()));
        Arc::new(sampler)
    }

    fn fixed_memory(mb: f64) -> Arc<dyn MemorySampler> {
        memory(Arc::new(Mutex::new(mb)))
    }

    fn drain(events: &mut broadcast::Receiver<BackpressureEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_memory_is_checked_before_queue_depth() {
        let mut queues = MockQueueControl::new();
        queues.expect_depth().never();
        queues.expect_pause().times(1).returning(|_| Ok(()));
        let manager = BackpressureManager::new(config(5, 100.0), Arc::new(queues), fixed_memory(150.0));
        manager.register("email");

        let status = manager.poll_once().await;
        assert!(status.active);
        assert_eq!(status.reason, BackpressureReason::MemoryLimit);
        assert_eq!(status.sampled_memory_mb, 150.0);
    }

    #[tokio::test]
    async fn test_deep_queue_activates_and_pauses() {
        let paused = Arc::new(Mutex::new(Vec::new()));
        let recorded = paused.clone();
        let mut queues = MockQueueControl::new();
        queues
            .expect_depth()
            .returning(|queue| Ok(if queue == "csv-import" { 6 } else { 0 }));
        queues.expect_pause().returning(move |queue| {
            recorded.lock().push(queue.to_string());
            Ok(())
        });
        let manager = BackpressureManager::new(config(5, 1200.0), Arc::new(queues), fixed_memory(10.0));
        manager.register("email");
        manager.register("csv-import");

        let status = manager.poll_once().await;
        assert_eq!(status.reason, BackpressureReason::QueueDepth);
        assert_eq!(status.sampled_queue_depth, 6);
        assert_eq!(*paused.lock(), vec!["email".to_string(), "csv-import".to_string()]);
    }

    #[tokio::test]
    async fn test_activation_is_edge_triggered() {
        let mut queues = MockQueueControl::new();
        queues.expect_pause().times(1).returning(|_| Ok(()));
        let manager = BackpressureManager::new(config(5, 100.0), Arc::new(queues), fixed_memory(150.0));
        manager.register("email");
        let mut events = manager.subscribe();

        manager.poll_once().await;
        manager.poll_once().await;

        assert_eq!(drain(&mut events), vec!["backpressure:activated"]);
    }

    #[tokio::test]
    async fn test_recovery_deactivates_and_resumes() {
        let depth = Arc::new(Mutex::new(6u64));
        let reported = depth.clone();
        let mb = Arc::new(Mutex::new(150.0));
        let mut queues = MockQueueControl::new();
        queues
            .expect_depth()
            .returning(move |_| Ok(*reported.lock()));
        queues.expect_pause().times(2).returning(|_| Ok(()));
        queues.expect_resume().times(2).returning(|_| Ok(()));
        let manager = BackpressureManager::new(config(5, 100.0), Arc::new(queues), memory(mb.clone()));
        manager.register("email");
        manager.register("analytics");
        let mut events = manager.subscribe();

        assert!(manager.poll_once().await.active);
        *mb.lock() = 50.0;
        let status = manager.poll_once().await;
        assert!(status.active);
        assert_eq!(status.reason, BackpressureReason::MemoryLimit);

        *depth.lock() = 2;
        let status = manager.poll_once().await;
        assert!(!status.active);
        assert_eq!(status.reason, BackpressureReason::None);
        assert_eq!(status.sampled_queue_depth, 2);
        assert_eq!(
            drain(&mut events),
            vec!["backpressure:activated", "backpressure:deactivated"]
        );
    }

    #[tokio::test]
    async fn test_manual_activation_is_sticky_until_released() {
        let mut queues = MockQueueControl::new();
        queues.expect_depth().returning(|_| Ok(0));
        queues.expect_pause().times(1).returning(|_| Ok(()));
        queues.expect_resume().times(1).returning(|_| Ok(()));
        let manager = BackpressureManager::new(config(5, 100.0), Arc::new(queues), fixed_memory(10.0));
        manager.register("email");

        let status = manager.force_backpressure().await;
        assert!(status.active);
        assert_eq!(status.reason, BackpressureReason::Manual);

        let status = manager.poll_once().await;
        assert!(status.active);
        assert_eq!(status.reason, BackpressureReason::Manual);

        assert!(!manager.release_backpressure().await.active);
        assert!(!manager.poll_once().await.active);
    }

    #[tokio::test]
    async fn test_forcing_during_automatic_activation_pins_it() {
        let mut queues = MockQueueControl::new();
        queues.expect_pause().times(1).returning(|_| Ok(()));
        let manager = BackpressureManager::new(config(5, 100.0), Arc::new(queues), fixed_memory(150.0));
        manager.register("email");
        let mut events = manager.subscribe();

        manager.poll_once().await;
        let status = manager.force_backpressure().await;
        assert_eq!(status.reason, BackpressureReason::Manual);
        assert_eq!(manager.status().reason, BackpressureReason::Manual);
        assert_eq!(drain(&mut events), vec!["backpressure:activated"]);
    }

    #[tokio::test]
    async fn test_depth_errors_skip_only_that_queue() {
        let mut queues = MockQueueControl::new();
        queues.expect_depth().returning(|queue| {
            if queue == "email" {
                Err(QueueError::Broker {
                    message: "timeout".into(),
                    transient: true,
                })
            } else {
                Ok(9)
            }
        });
        queues.expect_pause().returning(|_| Ok(()));
        let manager = BackpressureManager::new(config(5, 1200.0), Arc::new(queues), fixed_memory(10.0));
        manager.register("email");
        manager.register("analytics");

        let status = manager.poll_once().await;
        assert_eq!(status.reason, BackpressureReason::QueueDepth);
    }

    #[tokio::test]
    async fn test_pause_failure_keeps_decision() {
        let mut queues = MockQueueControl::new();
        queues
            .expect_pause()
            .returning(|queue| Err(QueueError::UnknownQueue(queue.to_string())));
        let manager = BackpressureManager::new(config(5, 100.0), Arc::new(queues), fixed_memory(150.0));
        manager.register("email");
        manager.register("audio-mix");

        assert!(manager.poll_once().await.active);
        assert!(manager.is_active());
    }

    #[tokio::test]
    async fn test_failed_pause_is_retried_until_it_sticks() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let mut queues = MockQueueControl::new();
        queues.expect_pause().returning(move |queue| {
            let mut calls = recorded.lock();
            calls.push(queue.to_string());
            let attempts = calls.iter().filter(|q| q.as_str() == queue).count();
            if queue == "email" && attempts == 1 {
                Err(QueueError::Broker {
                    message: "connection reset".into(),
                    transient: true,
                })
            } else {
                Ok(())
            }
        });
        let manager = BackpressureManager::new(config(5, 100.0), Arc::new(queues), fixed_memory(150.0));
        manager.register("email");
        manager.register("analytics");
        let mut events = manager.subscribe();

        for _ in 0..3 {
            assert!(manager.poll_once().await.active);
        }

        assert_eq!(
            *calls.lock(),
            vec![
                "email".to_string(),
                "analytics".to_string(),
                "email".to_string()
            ]
        );
        assert_eq!(drain(&mut events), vec!["backpressure:activated"]);
    }

    #[tokio::test]
    async fn test_failed_resume_is_retried_after_recovery() {
        let mb = Arc::new(Mutex::new(150.0));
        let resumes = Arc::new(Mutex::new(0));
        let counted = resumes.clone();
        let mut queues = MockQueueControl::new();
        queues.expect_depth().returning(|_| Ok(0));
        queues.expect_pause().times(1).returning(|_| Ok(()));
        queues.expect_resume().returning(move |queue| {
            let mut resumes = counted.lock();
            *resumes += 1;
            if *resumes == 1 {
                Err(QueueError::UnknownQueue(queue.to_string()))
            } else {
                Ok(())
            }
        });
        let manager = BackpressureManager::new(config(5, 100.0), Arc::new(queues), memory(mb.clone()));
        manager.register("email");

        manager.poll_once().await;
        *mb.lock() = 10.0;
        assert!(!manager.poll_once().await.active);
        assert_eq!(*resumes.lock(), 1);

        assert!(!manager.poll_once().await.active);
        assert!(!manager.poll_once().await.active);
        assert_eq!(*resumes.lock(), 2);
    }

    #[tokio::test]
    async fn test_missing_memory_sample_falls_back_to_queue_checks() {
        let mut sampler = MockMemorySampler::new();
        sampler.expect_used_mb().returning(|| None);
        let mut queues = MockQueueControl::new();
        queues.expect_depth().returning(|_| Ok(1));
        let manager = BackpressureManager::new(config(5, 100.0), Arc::new(queues), Arc::new(sampler));
        manager.register("email");

        let status = manager.poll_once().await;
        assert!(!status.active);
        assert_eq!(status.sampled_queue_depth, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_polls_on_interval() {
        let mut queues = MockQueueControl::new();
        queues.expect_pause().times(1).returning(|_| Ok(()));
        let manager = Arc::new(BackpressureManager::new(
            config(5, 100.0),
            Arc::new(queues),
            fixed_memory(150.0),
        ));
        manager.register("email");
        let cancel = CancellationToken::new();
        let monitor = manager.clone().start(cancel.clone());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(!manager.is_active());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager.is_active());

        cancel.cancel();
        monitor.await.unwrap();
    }

    #[test]
    fn test_register_is_idempotent() {
        let manager = BackpressureManager::new(
            BackpressureConfig::default(),
            Arc::new(MockQueueControl::new()),
            fixed_memory(0.0),
        );
        manager.register("email");
        manager.register("email");
        assert_eq!(manager.registered(), vec!["email".to_string()]);
    }
}
