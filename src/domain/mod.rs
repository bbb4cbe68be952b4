//! Domain layer - Pure types shared by every component.

pub mod backpressure;
pub mod families;
pub mod jobs;
pub mod policy;
