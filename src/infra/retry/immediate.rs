//! Retry in place, re-queueing only interrupted tasks.

use std::sync::Arc;

use crate::core::{RetryPolicy, ScheduledTask, SchedulerQueue, TaskError};

use super::requeue;

/// Default policy: every retryable failure is retried immediately by the
/// thread that saw it. An interrupted task is handed to the backing queue so
/// another consumer picks it up.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateRetryPolicy;

impl RetryPolicy for ImmediateRetryPolicy {
    fn handoff_retry(&self, task: &Arc<ScheduledTask>, cause: &TaskError, queue: &dyn SchedulerQueue) -> bool {
        cause.is_interrupted() && requeue(task, queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SchedulerError;
    use crate::infra::queue::{InMemorySchedulerQueue, QueueOrdering};
    use crate::infra::retry::test_support::attempted_task;

    #[test]
    fn test_retries_in_place_unless_interrupted() {
        let queue = InMemorySchedulerQueue::new(QueueOrdering::Fifo, 10);
        let task = attempted_task(5);
        let conflict = TaskError::retryable(anyhow::anyhow!("conflict"));

        assert!(!ImmediateRetryPolicy.handoff_retry(&task, &conflict, &queue));
        assert!(queue.is_empty());

        assert!(ImmediateRetryPolicy.handoff_retry(&task, &TaskError::Interrupted, &queue));
        assert_eq!(queue.ready_count(), 1);
    }

    #[test]
    fn test_refused_handoff_reports_false() {
        let queue = InMemorySchedulerQueue::new(QueueOrdering::Fifo, 10);
        queue.shutdown();
        let task = attempted_task(1);
        assert!(!ImmediateRetryPolicy.handoff_retry(&task, &TaskError::Interrupted, &queue));
        assert!(matches!(queue.add_task(task), Err(SchedulerError::Shutdown)));
    }
}
