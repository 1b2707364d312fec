//! Configuration models for the scheduler, its backing queue and retry policy.

pub mod scheduler;

pub use scheduler::{QueueBackendConfig, RetryPolicyConfig, SchedulerConfig, DEFAULT_RETRY_THRESHOLD};
