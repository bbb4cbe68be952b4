//! Backstage - background job queues with process-wide backpressure
//!
//! Hexagonal Architecture:
//! - domain/: Pure types (jobs, policies, backpressure status, job families)
//! - ports/: Trait definitions
//! - adapters/: Concrete implementations (Redis, in-memory, events, HTTP)
//! - application/: Services (connections, registry, workers, backpressure)
//! - config: Environment configuration

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;

// Re-exports for convenience
pub use application::backpressure::{BackpressureConfig, BackpressureManager};
pub use application::registry::QueueRegistry;
pub use application::worker::{WorkerOptions, WorkerPool};
pub use config::Config;
pub use error::{ConnectionError, JobError, QueueError};
