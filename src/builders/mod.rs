//! Builders that assemble scheduler components from configuration.

pub mod scheduler_builder;

pub use scheduler_builder::{build_retry_policy, build_scheduler_queue, SchedulerBuilder};
