//! Execution engine: drives one task through attempt, transaction and
//! commit, retry or abort.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, trace, warn};

use crate::core::{
    ExecutionContext, Interrupted, RetryStatus, ScheduledTask, SchedulerError, TaskError, Transaction,
    TransactionHandle, TransactionTimeout,
};

use super::SchedulerCore;

impl SchedulerCore {
    /// Run `task` until it finishes or its retry is handed off.
    ///
    /// Returns `Ok(true)` when the task is finished, `Ok(false)` when another
    /// thread will retry it.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the attempt was interrupted. When
    /// `retry_on_interruption` is set the task is first handed to the retry
    /// policy, and dropped if the policy refuses it.
    pub(crate) fn execute_task(
        &self,
        task: &Arc<ScheduledTask>,
        caller: &ExecutionContext,
        unbounded: bool,
        retry_on_interruption: bool,
    ) -> Result<bool, Interrupted> {
        let kernel = self.kernel_context.read().clone();
        let ctx = caller.bind(kernel, task.owner().clone());

        loop {
            if !task.set_running(true) {
                trace!(task = %task, "Task already finished");
                return Ok(true);
            }

            let backlog = self.backing_queue.ready_count() + self.dependency_count.load(Ordering::Acquire);
            self.profile.start_task(
                task.runnable().base_type(),
                task.owner(),
                task.start_time_ms(),
                backlog,
            );

            let timeout = if unbounded {
                TransactionTimeout::Unbounded
            } else {
                TransactionTimeout::Bounded(task.timeout())
            };
            let handle = self.transaction_coordinator.create_transaction(timeout);
            let transaction = handle.transaction();
            trace!(task = %task, transaction = %transaction.id(), "Running attempt");

            let cause = match self.run_attempt(task, &ctx, handle, &transaction) {
                Ok(()) => {
                    self.profile.finish_task(task.try_count(), None);
                    task.set_done(None);
                    trace!(task = %task, "Task completed");
                    return Ok(true);
                }
                Err(cause) => cause,
            };

            if !transaction.is_aborted() {
                transaction.abort(cause.clone());
            }
            self.profile.finish_task(task.try_count(), Some(&cause));

            if cause.is_interrupted() {
                if task.set_interrupted() && retry_on_interruption {
                    if self
                        .retry_policy
                        .handoff_retry(task, &cause, self.backing_queue.as_ref())
                    {
                        debug!(task = %task, "Handed off interrupted task");
                    } else {
                        warn!(task = %task, "Dropping interrupted task that could not be handed off");
                        task.set_done(Some(cause));
                    }
                }
                return Err(Interrupted);
            }

            if !cause.should_retry() {
                if task.is_recurring() {
                    warn!(task = %task, error = %cause, "Skipping an occurrence of recurring task");
                } else {
                    warn!(task = %task, error = %cause, "Dropping failed task");
                }
                task.set_done(Some(cause));
                return Ok(true);
            }

            task.set_running(false);
            if self
                .retry_policy
                .handoff_retry(task, &cause, self.backing_queue.as_ref())
            {
                debug!(task = %task, error = %cause, "Handed off retry");
                return Ok(false);
            }
            trace!(task = %task, error = %cause, "Retrying task in place");
        }
    }

    /// One attempt inside `transaction`; the transaction-bound context lives
    /// only for the duration of the body.
    fn run_attempt(
        &self,
        task: &ScheduledTask,
        ctx: &ExecutionContext,
        handle: Box<dyn TransactionHandle>,
        transaction: &Arc<dyn Transaction>,
    ) -> Result<(), TaskError> {
        let txn_ctx = ctx.with_transaction(Arc::clone(transaction));
        self.access
            .notify_new_transaction(&**transaction, task.start_time_ms(), task.try_count());
        self.profile.note_transactional(transaction.id());

        let result = panic::catch_unwind(AssertUnwindSafe(|| task.runnable().run(&txn_ctx)))
            .unwrap_or_else(|payload| {
                Err(TaskError::fatal(anyhow!("task panicked: {}", panic_message(payload.as_ref()))))
            });
        drop(txn_ctx);
        result?;

        // The body may have swallowed the failure that aborted its transaction.
        if transaction.is_aborted() {
            return Err(transaction
                .abort_cause()
                .unwrap_or_else(|| TaskError::fatal(anyhow!("transaction {} was aborted", transaction.id()))));
        }
        handle.commit()
    }

    /// Run `task` on the calling thread and block until it finishes.
    ///
    /// A task cancelled because the scheduler shut down reports
    /// [`SchedulerError::Shutdown`].
    pub(crate) fn wait_for_task(
        &self,
        task: &Arc<ScheduledTask>,
        caller: &ExecutionContext,
        unbounded: bool,
    ) -> Result<(), SchedulerError> {
        let waited = self
            .execute_task(task, caller, unbounded, false)
            .and_then(|_| task.wait(caller.interrupt()));

        let outcome = match waited {
            Ok(outcome) => outcome,
            Err(Interrupted) => {
                if task.cancel(false) {
                    self.backing_queue.notify_cancelled(task);
                    debug!(task = %task, "Cancelled task after caller was interrupted");
                    return Err(SchedulerError::Interrupted);
                }
                if task.is_cancelled() {
                    return Err(SchedulerError::Interrupted);
                }
                task.try_outcome().ok_or(SchedulerError::Interrupted)?
            }
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(TaskError::Cancelled) if self.is_shutdown() => Err(SchedulerError::Shutdown),
            Err(cause) => Err(SchedulerError::Task(cause)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::core::{NamedTask, NoopAccessCoordinator, NoopProfileCollector, SchedulerParts};
    use crate::infra::queue::{InMemorySchedulerQueue, QueueOrdering};
    use crate::infra::retry::ImmediateRetryPolicy;
    use crate::infra::transaction::InMemoryTransactionCoordinator;
    use crate::util::clock::now_ms;
    use crate::util::serde::{Identity, Priority};

    /// A core without consumers; tests drive the engine directly.
    fn idle_core() -> SchedulerCore {
        SchedulerCore::new(SchedulerParts {
            transaction_coordinator: Arc::new(InMemoryTransactionCoordinator::new(
                Duration::from_secs(10),
                Duration::from_secs(60),
            )),
            queue: Arc::new(InMemorySchedulerQueue::new(QueueOrdering::Fifo, 16)),
            retry_policy: Arc::new(ImmediateRetryPolicy),
            profile: Arc::new(NoopProfileCollector),
            access: Arc::new(NoopAccessCoordinator),
        })
    }

    #[test]
    fn test_wait_on_cancelled_task_reports_interruption() {
        let core = idle_core();
        let slot: Arc<Mutex<Weak<ScheduledTask>>> = Arc::new(Mutex::new(Weak::new()));
        let body_slot = Arc::clone(&slot);
        let runnable = NamedTask::shared("cancelled-mid-attempt", move |_ctx: &ExecutionContext| {
            if let Some(task) = body_slot.lock().upgrade() {
                task.cancel(true);
            }
            Err(TaskError::Interrupted)
        });
        let task = Arc::new(core.new_task(runnable, Identity::new("tester"), Priority::default(), now_ms()));
        *slot.lock() = Arc::downgrade(&task);

        let caller = ExecutionContext::new(Identity::new("caller"));
        let result = core.wait_for_task(&task, &caller, false);

        assert!(matches!(result, Err(SchedulerError::Interrupted)));
        assert!(task.is_cancelled());
    }

    #[test]
    fn test_wait_reports_task_failure() {
        let core = idle_core();
        let runnable = NamedTask::shared("fails", |_ctx: &ExecutionContext| {
            Err(TaskError::fatal(anyhow!("bad input")))
        });
        let task = Arc::new(core.new_task(runnable, Identity::new("tester"), Priority::default(), now_ms()));

        let result = core.wait_for_task(&task, &ExecutionContext::new(Identity::new("caller")), false);
        assert!(matches!(result, Err(SchedulerError::Task(TaskError::Failed { retry: false, .. }))));
        assert_eq!(task.try_count(), 1);
    }
}
