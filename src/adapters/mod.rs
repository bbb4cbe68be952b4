//! Adapters - Concrete implementations of ports.

pub mod events;
pub mod http;
pub mod memory;
pub mod process;
pub mod redis;
