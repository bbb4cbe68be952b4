//! Ports - Traits at the seams between the core and its collaborators.

pub mod broker;
pub mod connection;
pub mod handler;
pub mod queue;
