//! Redis adapter.
//!
//! This module provides Redis-backed implementations of:
//! - `ConnectionFactory` for the shared command and subscriber connections
//! - `JobBroker` for job storage, dispatch and retention

mod connection;
mod error;
mod queue;
mod scripts;

pub use connection::{RedisConnection, RedisConnectionFactory, RedisSubscriber};
pub use error::is_transient;
pub use queue::{RedisBroker, RedisConnections};
