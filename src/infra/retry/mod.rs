//! Retry hand-off policies.

pub mod immediate;
pub mod now_or_later;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::{ScheduledTask, SchedulerQueue};

pub use immediate::ImmediateRetryPolicy;
pub use now_or_later::NowOrLaterRetryPolicy;

/// Put `task` back on `queue`; `false` if the queue refused it.
fn requeue(task: &Arc<ScheduledTask>, queue: &dyn SchedulerQueue) -> bool {
    match queue.add_task(Arc::clone(task)) {
        Ok(()) => {
            debug!(task = %task, "Re-queued task for retry");
            true
        }
        Err(e) => {
            warn!(task = %task, error = %e, "Backing queue refused retry");
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::core::{NamedTask, ScheduledTask};
    use crate::util::clock::now_ms;
    use crate::util::serde::{Identity, Priority};

    /// A pending task that has been attempted `tries` times.
    pub(crate) fn attempted_task(tries: u32) -> Arc<ScheduledTask> {
        let task = Arc::new(ScheduledTask::new(
            NamedTask::shared("retry", |_ctx| Ok(())),
            Identity::new("tester"),
            Priority::Normal,
            now_ms(),
            Duration::from_millis(100),
        ));
        for _ in 0..tries {
            task.set_running(true);
            task.set_running(false);
        }
        task
    }
}
