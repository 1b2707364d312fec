//! Core scheduling abstractions, task state machine and scheduler facade.

pub mod context;
pub mod dependent_queue;
pub mod error;
pub mod profile;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod transaction;

pub use context::{ExecutionContext, Interrupt, KernelContext};
pub use dependent_queue::DependentTaskQueue;
pub use error::{AppResult, Interrupted, RetryStatus, SchedulerError, TaskError};
pub use profile::{InMemoryProfileCollector, NoopProfileCollector, ProfileAction, ProfileCollector, ProfileEvent};
pub use queue::{RecurringTaskHandle, RetryPolicy, SchedulerQueue, TaskReservation};
pub use scheduler::{SchedulerParts, SchedulerStats, TransactionScheduler};
pub use task::{KernelRunnable, NamedTask, ScheduledTask, TaskOutcome, TaskStatus};
pub use transaction::{
    AccessCoordinator, NoopAccessCoordinator, Transaction, TransactionCoordinator, TransactionHandle,
    TransactionId, TransactionTimeout,
};
