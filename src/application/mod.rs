//! Application layer - Services that use ports.

pub mod backpressure;
pub mod connection;
pub mod registry;
pub mod worker;
