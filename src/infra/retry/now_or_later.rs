//! Retry in place a bounded number of times, then re-queue.

use std::sync::Arc;

use tracing::trace;

use crate::core::{RetryPolicy, ScheduledTask, SchedulerQueue, TaskError};

use super::requeue;

/// Retries in place until the task has been attempted `threshold` times;
/// from then on every retry goes back to the backing queue, letting other
/// work run first. Interrupted tasks are always re-queued.
#[derive(Debug, Clone, Copy)]
pub struct NowOrLaterRetryPolicy {
    threshold: u32,
}

impl NowOrLaterRetryPolicy {
    /// Create a policy handing off from the `threshold`-th attempt on.
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    /// Attempts after which retries are handed off.
    #[must_use]
    pub const fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl RetryPolicy for NowOrLaterRetryPolicy {
    fn handoff_retry(&self, task: &Arc<ScheduledTask>, cause: &TaskError, queue: &dyn SchedulerQueue) -> bool {
        if cause.is_interrupted() || task.try_count() >= self.threshold {
            return requeue(task, queue);
        }
        trace!(task = %task, threshold = self.threshold, "Retrying in place below threshold");
        false
    }
}
