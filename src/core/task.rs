//! Scheduled tasks and their state machine.
//!
//! A [`ScheduledTask`] is one request to run a [`KernelRunnable`]. It moves
//! through `Pending -> Running -> {Pending, Interrupted, Done}` and can be
//! cancelled at any point before it is done. The result is written once and
//! can then be read by any number of threads.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::core::dependent_queue::DependentQueueCore;
use crate::core::{ExecutionContext, Interrupt, Interrupted, RecurringTaskHandle, TaskError};
use crate::util::clock::now_ms;
use crate::util::serde::{Identity, Priority, TaskId};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Final result of a task: success, or the cause it was dropped with.
pub type TaskOutcome = Result<(), TaskError>;

/// A unit of work run inside a transaction.
///
/// Any `Fn(&ExecutionContext) -> Result<(), TaskError>` closure is a
/// `KernelRunnable`.
pub trait KernelRunnable: Send + Sync {
    /// Short description used in logs and profiling.
    fn base_type(&self) -> &str;
    /// Run the task body.
    ///
    /// # Errors
    ///
    /// Returns the failure cause; [`TaskError::Failed`] with `retry: true`
    /// asks the scheduler to try again.
    fn run(&self, ctx: &ExecutionContext) -> Result<(), TaskError>;
}

impl<F> KernelRunnable for F
where
    F: Fn(&ExecutionContext) -> Result<(), TaskError> + Send + Sync,
{
    fn base_type(&self) -> &str {
        std::any::type_name::<F>()
    }

    fn run(&self, ctx: &ExecutionContext) -> Result<(), TaskError> {
        self(ctx)
    }
}

/// A closure with a name to show in logs and profiling.
pub struct NamedTask<F> {
    name: String,
    body: F,
}

impl<F> NamedTask<F>
where
    F: Fn(&ExecutionContext) -> Result<(), TaskError> + Send + Sync + 'static,
{
    /// Wrap `body` under `name`.
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    /// Wrap `body` under `name`, ready for submission.
    pub fn shared(name: impl Into<String>, body: F) -> Arc<dyn KernelRunnable> {
        Arc::new(Self::new(name, body))
    }
}

impl<F> KernelRunnable for NamedTask<F>
where
    F: Fn(&ExecutionContext) -> Result<(), TaskError> + Send + Sync,
{
    fn base_type(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &ExecutionContext) -> Result<(), TaskError> {
        (self.body)(ctx)
    }
}

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be run (or re-run).
    Pending,
    /// An attempt is in progress.
    Running,
    /// The last attempt was interrupted.
    Interrupted,
    /// Finished, successfully or not.
    Done,
    /// Cancelled before it finished.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task has reached a terminal state.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

struct TaskState {
    status: TaskStatus,
    start_time_ms: u128,
    try_count: u32,
    outcome: Option<TaskOutcome>,
    recurring_handle: Option<Weak<dyn RecurringTaskHandle>>,
}

/// One request to run a task.
pub struct ScheduledTask {
    id: TaskId,
    runnable: Arc<dyn KernelRunnable>,
    owner: Identity,
    priority: Priority,
    timeout: Duration,
    period_ms: Option<u128>,
    queue: Option<Arc<DependentQueueCore>>,
    state: Mutex<TaskState>,
    finished: Condvar,
}

impl ScheduledTask {
    /// Create a one-shot task requested to start at `start_time_ms`.
    pub fn new(
        runnable: Arc<dyn KernelRunnable>,
        owner: Identity,
        priority: Priority,
        start_time_ms: u128,
        timeout: Duration,
    ) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            runnable,
            owner,
            priority,
            timeout,
            period_ms: None,
            queue: None,
            state: Mutex::new(TaskState {
                status: TaskStatus::Pending,
                start_time_ms,
                try_count: 0,
                outcome: None,
                recurring_handle: None,
            }),
            finished: Condvar::new(),
        }
    }

    /// Make this task recur every `period_ms` milliseconds.
    #[must_use]
    pub fn with_period(mut self, period_ms: u128) -> Self {
        self.period_ms = Some(period_ms);
        self
    }

    pub(crate) fn with_queue(mut self, queue: Arc<DependentQueueCore>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Unique identifier.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// The task body.
    #[must_use]
    pub const fn runnable(&self) -> &Arc<dyn KernelRunnable> {
        &self.runnable
    }

    /// Identity the task runs for.
    #[must_use]
    pub const fn owner(&self) -> &Identity {
        &self.owner
    }

    /// Priority hint.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Per-attempt transaction timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Recurrence period, if this is a recurring task.
    #[must_use]
    pub const fn period_ms(&self) -> Option<u128> {
        self.period_ms
    }

    /// Whether this is one occurrence of a recurring task.
    #[must_use]
    pub const fn is_recurring(&self) -> bool {
        self.period_ms.is_some()
    }

    /// Requested start time (ms since epoch).
    #[must_use]
    pub fn start_time_ms(&self) -> u128 {
        self.state.lock().start_time_ms
    }

    /// Attempts made so far.
    #[must_use]
    pub fn try_count(&self) -> u32 {
        self.state.lock().try_count
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// Whether the task is done or cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status().is_finished()
    }

    /// Whether the task was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status() == TaskStatus::Cancelled
    }

    /// Whether the recurrence this task belongs to has been cancelled.
    #[must_use]
    pub fn is_recurrence_cancelled(&self) -> bool {
        self.recurring_handle().is_some_and(|h| h.is_cancelled())
    }

    /// The recurring handle, while its owner still holds it.
    #[must_use]
    pub fn recurring_handle(&self) -> Option<Arc<dyn RecurringTaskHandle>> {
        self.state.lock().recurring_handle.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_recurring_handle(&self, handle: &Arc<dyn RecurringTaskHandle>) {
        self.state.lock().recurring_handle = Some(Arc::downgrade(handle));
    }

    pub(crate) const fn dependent_queue(&self) -> Option<&Arc<DependentQueueCore>> {
        self.queue.as_ref()
    }

    /// `true` starts an attempt: fails if the task is finished, otherwise
    /// moves to `Running` and counts the attempt. `false` returns a running
    /// task to `Pending`.
    pub(crate) fn set_running(&self, running: bool) -> bool {
        let mut state = self.state.lock();
        if running {
            if state.status.is_finished() {
                return false;
            }
            state.status = TaskStatus::Running;
            state.try_count += 1;
            true
        } else if state.status == TaskStatus::Running {
            state.status = TaskStatus::Pending;
            true
        } else {
            false
        }
    }

    /// Marks a running attempt as interrupted; `true` only the first time.
    pub(crate) fn set_interrupted(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != TaskStatus::Running {
            return false;
        }
        state.status = TaskStatus::Interrupted;
        true
    }

    /// Finish the task. `None` means success.
    pub(crate) fn set_done(&self, cause: Option<TaskError>) -> bool {
        let mut state = self.state.lock();
        if state.status.is_finished() {
            return false;
        }
        state.status = TaskStatus::Done;
        state.outcome = Some(cause.map_or(Ok(()), Err));
        self.finished.notify_all();
        true
    }

    /// Cancel the task.
    ///
    /// Fails if the task already finished, or if an attempt is running and
    /// `force` is `false`. A cancelled task is never attempted again.
    pub fn cancel(&self, force: bool) -> bool {
        let mut state = self.state.lock();
        if state.status.is_finished() || (state.status == TaskStatus::Running && !force) {
            return false;
        }
        state.status = TaskStatus::Cancelled;
        state.outcome = Some(Err(TaskError::Cancelled));
        self.finished.notify_all();
        true
    }

    /// Logical start is when the tasks ahead of it have run.
    pub(crate) fn reset_start_time(&self) {
        self.state.lock().start_time_ms = now_ms();
    }

    /// The result, if the task has finished.
    #[must_use]
    pub fn try_outcome(&self) -> Option<TaskOutcome> {
        self.state.lock().outcome.clone()
    }

    /// Block until the task finishes.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if `interrupt` fires first; the interruption
    /// is consumed.
    pub fn wait(self: &Arc<Self>, interrupt: &Interrupt) -> Result<TaskOutcome, Interrupted> {
        let task = Arc::clone(self);
        let _registration = interrupt.register_waker(Arc::new(move || {
            // Taking the lock orders this notify after the waiter parks.
            let _state = task.state.lock();
            task.finished.notify_all();
        }));
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Ok(outcome.clone());
            }
            interrupt.check()?;
            self.finished.wait(&mut state);
        }
    }

    /// The next occurrence of a recurring task, unless its recurrence was
    /// cancelled.
    ///
    /// It starts one period after this occurrence, or now if that moment has
    /// already passed.
    pub(crate) fn next_occurrence(&self) -> Option<Self> {
        let period = self.period_ms?;
        let state = self.state.lock();
        let handle = state.recurring_handle.clone();
        if handle.as_ref().and_then(Weak::upgrade).is_some_and(|h| h.is_cancelled()) {
            return None;
        }
        let start = state.start_time_ms.saturating_add(period).max(now_ms());
        drop(state);

        let next = Self::new(
            Arc::clone(&self.runnable),
            self.owner.clone(),
            self.priority,
            start,
            self.timeout,
        )
        .with_period(period);
        next.state.lock().recurring_handle = handle;
        Some(next)
    }
}

impl fmt::Display for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "ScheduledTask[id={}, type={}, owner={}, priority={:?}, start={}, tries={}",
            self.id,
            self.runnable.base_type(),
            self.owner,
            self.priority,
            state.start_time_ms,
            state.try_count,
        )?;
        if let Some(period) = self.period_ms {
            write!(f, ", period={period}")?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("type", &self.runnable.base_type())
            .field("owner", &self.owner)
            .field("status", &state.status)
            .field("try_count", &state.try_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn make_task() -> Arc<ScheduledTask> {
        Arc::new(ScheduledTask::new(
            NamedTask::shared("noop", |_ctx| Ok(())),
            Identity::new("tester"),
            Priority::Normal,
            now_ms(),
            Duration::from_millis(100),
        ))
    }

    #[test]
    fn test_running_counts_attempts() {
        let task = make_task();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.set_running(true));
        assert_eq!(task.try_count(), 1);
        assert!(task.set_running(false));
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.set_running(true));
        assert_eq!(task.try_count(), 2);
    }

    #[test]
    fn test_done_is_terminal_and_repeatable() {
        let task = make_task();
        assert!(task.set_running(true));
        assert!(task.set_done(Some(TaskError::fatal(anyhow::anyhow!("nope")))));
        assert!(!task.set_done(None));
        assert!(!task.set_running(true));
        assert_eq!(task.try_count(), 1);

        for _ in 0..3 {
            let outcome = task.try_outcome().unwrap();
            assert_eq!(outcome.unwrap_err().to_string(), "nope");
        }
    }

    #[test]
    fn test_interrupted_only_from_running() {
        let task = make_task();
        assert!(!task.set_interrupted());
        task.set_running(true);
        assert!(task.set_interrupted());
        assert!(!task.set_interrupted());
        assert_eq!(task.status(), TaskStatus::Interrupted);
        // An interrupted task can be handed to another thread and re-run.
        assert!(task.set_running(true));
    }

    #[test]
    fn test_cancel_rules() {
        let pending = make_task();
        assert!(pending.cancel(false));
        assert!(!pending.set_running(true));
        assert!(matches!(pending.try_outcome(), Some(Err(TaskError::Cancelled))));

        let running = make_task();
        running.set_running(true);
        assert!(!running.cancel(false));
        assert!(running.cancel(true));
        assert!(!running.set_done(None));
        assert!(running.is_cancelled());

        let done = make_task();
        done.set_running(true);
        done.set_done(None);
        assert!(!done.cancel(true));
        assert!(matches!(done.try_outcome(), Some(Ok(()))));
    }

    #[test]
    fn test_wait_wakes_on_completion() {
        let task = make_task();
        let waiter = {
            let task = Arc::clone(&task);
            thread::spawn(move || task.wait(&Interrupt::new()))
        };
        thread::sleep(Duration::from_millis(20));
        task.set_running(true);
        task.set_done(None);
        assert!(matches!(waiter.join().unwrap(), Ok(Ok(()))));
    }

    #[test]
    fn test_wait_is_interruptible() {
        let task = make_task();
        let interrupt = Interrupt::new();
        let waiter = {
            let task = Arc::clone(&task);
            let interrupt = interrupt.clone();
            thread::spawn(move || task.wait(&interrupt))
        };
        thread::sleep(Duration::from_millis(20));
        interrupt.interrupt();
        assert!(matches!(waiter.join().unwrap(), Err(Interrupted)));
        assert!(!interrupt.is_interrupted());
        assert_eq!(task.status(), TaskStatus::Pending);
    }

    #[test]
    fn test_next_occurrence_never_starts_in_the_past() {
        let body = NamedTask::shared("tick", |_ctx| Ok(()));
        let task = ScheduledTask::new(body, Identity::system(), Priority::High, 1_000, Duration::from_millis(10))
            .with_period(50);
        let before = now_ms();
        let next = task.next_occurrence().unwrap();
        assert!(next.start_time_ms() >= before);
        assert_eq!(next.period_ms(), Some(50));
        assert_eq!(next.priority(), Priority::High);
        assert_ne!(next.id(), task.id());

        let one_shot = make_task();
        assert!(one_shot.next_occurrence().is_none());
    }
}
