//! Dependent task queues.
//!
//! Tasks added through one [`DependentTaskQueue`] run strictly in the order
//! they were added, one at a time, while tasks from other queues (and plain
//! submissions) keep running concurrently. At most one task of a queue sits
//! in the backing ordering queue; the rest wait here until the consumer that
//! finished their predecessor calls `schedule_next`.
//!
//! Waiting entries carry no link back to their queue. The link is attached
//! when an entry is handed to the backing queue, so the in-flight task keeps
//! the queue alive without any reference cycle.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::core::scheduler::SchedulerCore;
use crate::core::{KernelRunnable, ScheduledTask, SchedulerError};
use crate::util::clock::now_ms;
use crate::util::serde::{Identity, Priority};

struct QueueState {
    pending: VecDeque<ScheduledTask>,
    in_scheduler: bool,
}

pub(crate) struct DependentQueueCore {
    state: Mutex<QueueState>,
}

impl DependentQueueCore {
    /// Called once a task from this queue has finished: submit the next
    /// waiting task, or mark the queue as no longer represented.
    pub(crate) fn schedule_next(self: &Arc<Self>, scheduler: &SchedulerCore) {
        let mut state = self.state.lock();
        while let Some(next) = state.pending.pop_front() {
            scheduler.dependency_count.fetch_sub(1, Ordering::AcqRel);
            next.reset_start_time();
            let task = Arc::new(next.with_queue(Arc::clone(self)));
            match scheduler.backing_queue.add_task(Arc::clone(&task)) {
                Ok(()) => {
                    trace!(task = %task, "submitted next dependent task");
                    return;
                }
                Err(e) => {
                    warn!(task = %task, error = %e, "dropping a dependent task the backing queue refused");
                }
            }
        }
        state.in_scheduler = false;
    }
}

/// FIFO of tasks that must run one after another.
pub struct DependentTaskQueue {
    core: Arc<DependentQueueCore>,
    scheduler: Weak<SchedulerCore>,
}

impl DependentTaskQueue {
    pub(crate) fn new(scheduler: &Arc<SchedulerCore>) -> Self {
        Self {
            core: Arc::new(DependentQueueCore {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    in_scheduler: false,
                }),
            }),
            scheduler: Arc::downgrade(scheduler),
        }
    }

    /// Add a task to run after every task previously added to this queue.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Shutdown` if the scheduler has been shut down
    /// - `SchedulerError::TaskRejected` if the backing queue refused the task
    pub fn add_task(&self, task: Arc<dyn KernelRunnable>, owner: Identity) -> Result<(), SchedulerError> {
        let scheduler = self.scheduler.upgrade().ok_or(SchedulerError::Shutdown)?;
        scheduler.ensure_running()?;
        let scheduled = scheduler.new_task(task, owner, Priority::default(), now_ms());

        let mut state = self.core.state.lock();
        if state.in_scheduler {
            scheduler.dependency_count.fetch_add(1, Ordering::AcqRel);
            state.pending.push_back(scheduled);
        } else {
            scheduler
                .backing_queue
                .add_task(Arc::new(scheduled.with_queue(Arc::clone(&self.core))))?;
            state.in_scheduler = true;
        }
        Ok(())
    }

    /// Tasks waiting behind the one currently submitted.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.core.state.lock().pending.len()
    }

    /// Whether a task from this queue is currently submitted or running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.state.lock().in_scheduler
    }
}
