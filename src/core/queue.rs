//! Contracts for the pluggable backing ordering queue and retry policy.

use std::sync::Arc;

use crate::core::{Interrupted, ScheduledTask, SchedulerError, TaskError};

/// A slot held in the backing queue for a task that has not been submitted.
pub trait TaskReservation: Send {
    /// Submit the reserved task.
    fn use_reservation(self: Box<Self>);
    /// Give the slot back without running the task.
    fn cancel(self: Box<Self>);
}

/// Controls the recurrence of a periodic task.
pub trait RecurringTaskHandle: Send + Sync {
    /// Start the recurrence.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidState`] if already started or cancelled.
    fn start(&self) -> Result<(), SchedulerError>;
    /// Stop all future occurrences.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidState`] if already cancelled.
    fn cancel(&self) -> Result<(), SchedulerError>;
    /// Whether the recurrence has been cancelled.
    fn is_cancelled(&self) -> bool;
}

/// Decides which ready task a consumer receives next.
pub trait SchedulerQueue: Send + Sync {
    /// Tasks ready to run right now.
    fn ready_count(&self) -> usize;

    /// Next ready task. With `wait`, blocks until one is ready.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] once the queue has been shut down.
    fn next_task(&self, wait: bool) -> Result<Option<Arc<ScheduledTask>>, Interrupted>;

    /// Reserve space for `task` without submitting it.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TaskRejected`] when no space is left and
    /// [`SchedulerError::Shutdown`] after shutdown.
    fn reserve_task(&self, task: Arc<ScheduledTask>) -> Result<Box<dyn TaskReservation>, SchedulerError>;

    /// Submit `task`; it becomes ready at its requested start time.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TaskRejected`] when no space is left and
    /// [`SchedulerError::Shutdown`] after shutdown.
    fn add_task(&self, task: Arc<ScheduledTask>) -> Result<(), SchedulerError>;

    /// Create the handle that starts and cancels the recurrence of `task`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Shutdown`] after shutdown.
    fn create_recurring_handle(
        &self,
        task: Arc<ScheduledTask>,
    ) -> Result<Arc<dyn RecurringTaskHandle>, SchedulerError>;

    /// `task` was cancelled and need not be handed out.
    fn notify_cancelled(&self, task: &Arc<ScheduledTask>);

    /// Stop handing out tasks and release blocked consumers.
    fn shutdown(&self);
}

/// Decides who retries a task that failed with a retryable cause.
pub trait RetryPolicy: Send + Sync {
    /// Returns `true` if the policy took the task (usually by re-queueing
    /// it on `queue`), `false` if the caller should retry it in place.
    fn handoff_retry(&self, task: &Arc<ScheduledTask>, cause: &TaskError, queue: &dyn SchedulerQueue) -> bool;
}
