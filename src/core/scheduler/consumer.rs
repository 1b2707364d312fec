//! Consumer threads pulling ready tasks from the backing queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, trace, warn};

use crate::core::{ExecutionContext, Interrupt, Interrupted, ScheduledTask, SchedulerError};
use crate::util::serde::Identity;

use super::SchedulerCore;

/// Spawn consumer `consumer_id` and register its interrupt token.
pub(super) fn spawn_consumer(core: &Arc<SchedulerCore>, consumer_id: usize) -> Result<(), SchedulerError> {
    let interrupt = Interrupt::new();
    core.consumers.lock().push(interrupt.clone());
    core.thread_count.fetch_add(1, Ordering::AcqRel);

    let thread_core = Arc::clone(core);
    let spawned = thread::Builder::new()
        .name(format!("txn-consumer-{consumer_id}"))
        .spawn(move || consume(&thread_core, consumer_id, interrupt));

    match spawned {
        Ok(worker) => {
            core.workers.lock().push(worker);
            Ok(())
        }
        Err(e) => {
            core.thread_count.fetch_sub(1, Ordering::AcqRel);
            Err(SchedulerError::Backend(format!("failed to spawn consumer {consumer_id}: {e}")))
        }
    }
}

/// Deregisters the consumer however its loop ends.
struct ConsumerRegistration<'a> {
    core: &'a SchedulerCore,
    consumer_id: usize,
}

impl<'a> ConsumerRegistration<'a> {
    fn join(core: &'a SchedulerCore, consumer_id: usize) -> Self {
        core.profile.notify_thread_added();
        debug!(consumer_id, "Consumer started");
        Self { core, consumer_id }
    }
}

impl Drop for ConsumerRegistration<'_> {
    fn drop(&mut self) {
        self.core.profile.notify_thread_removed();
        debug!(consumer_id = self.consumer_id, "Consumer exiting");
        if self.core.thread_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            info!("No more consumer threads");
            self.core.shutdown();
        }
    }
}

fn consume(core: &SchedulerCore, consumer_id: usize, interrupt: Interrupt) {
    let _registration = ConsumerRegistration::join(core, consumer_id);
    let ctx = ExecutionContext::with_interrupt(Identity::system(), interrupt);

    if panic::catch_unwind(AssertUnwindSafe(|| consume_loop(core, consumer_id, &ctx))).is_err() {
        error!(consumer_id, "Fatal error for consumer");
    }
}

fn consume_loop(core: &SchedulerCore, consumer_id: usize, ctx: &ExecutionContext) {
    loop {
        let task = match core.backing_queue.next_task(true) {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(Interrupted) => {
                debug!(consumer_id, "Consumer interrupted while waiting");
                return;
            }
        };
        if core.is_shutdown() {
            debug!(consumer_id, task = %task, "Not starting task after shutdown");
            task.cancel(true);
            return;
        }

        trace!(consumer_id, task = %task, "Consumer running task");
        match core.execute_task(&task, ctx, false, true) {
            Ok(true) => core.finish_occurrence(&task),
            Ok(false) => {}
            Err(Interrupted) => {
                if task.is_done() {
                    core.finish_occurrence(&task);
                }
                debug!(consumer_id, "Consumer interrupted");
                return;
            }
        }
    }
}

impl SchedulerCore {
    /// Follow-up once a task is finished: submit the next occurrence of a
    /// recurring task, and advance the dependent queue it came from.
    fn finish_occurrence(&self, task: &Arc<ScheduledTask>) {
        if task.is_recurring() {
            match task.next_occurrence() {
                Some(next) => {
                    let next = Arc::new(next);
                    if let Err(e) = self.backing_queue.add_task(Arc::clone(&next)) {
                        warn!(task = %next, error = %e, "Could not submit next occurrence");
                    }
                }
                None => debug!(task = %task, "Recurrence cancelled"),
            }
        }
        if let Some(queue) = task.dependent_queue() {
            queue.schedule_next(self);
        }
    }
}
