use crate::error::QueueError;
use async_trait::async_trait;

/// The slice of queue administration the backpressure manager relies on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueControl: Send + Sync {
    /// waiting + active + delayed
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;

    async fn pause(&self, queue: &str) -> Result<(), QueueError>;

    async fn resume(&self, queue: &str) -> Result<(), QueueError>;
}

/// Samples the memory used by this process.
#[cfg_attr(test, mockall::automock)]
pub trait MemorySampler: Send + Sync {
    /// Returns `None` when the sample could not be taken.
    fn used_mb(&self) -> Option<f64>;
}
