//! Transaction scheduler facade.
//!
//! The [`TransactionScheduler`] owns a fixed pool of consumer threads that
//! pull ready tasks from the backing ordering queue and run each attempt in
//! its own transaction. Callers can also run a task synchronously with
//! [`TransactionScheduler::run_task`], which drives the attempt on the
//! calling thread.
//!
//! # Example
//!
//! ```rust,ignore
//! use txn_scheduler::builders::SchedulerBuilder;
//! use txn_scheduler::config::SchedulerConfig;
//! use txn_scheduler::core::NamedTask;
//! use txn_scheduler::util::serde::Identity;
//!
//! let scheduler = SchedulerBuilder::new(SchedulerConfig::default()).build()?;
//! scheduler.schedule_task(NamedTask::shared("hello", |_ctx| Ok(())), Identity::new("alice"))?;
//! scheduler.shutdown();
//! ```

mod consumer;
mod engine;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::core::{
    AccessCoordinator, DependentTaskQueue, ExecutionContext, Interrupt, KernelContext, KernelRunnable,
    ProfileCollector, RecurringTaskHandle, RetryPolicy, ScheduledTask, SchedulerError, SchedulerQueue,
    TaskReservation, TransactionCoordinator,
};
use crate::util::clock::now_ms;
use crate::util::serde::{Identity, Priority};

/// Collaborators the scheduler drives.
pub struct SchedulerParts {
    /// Creates the transaction each attempt runs in.
    pub transaction_coordinator: Arc<dyn TransactionCoordinator>,
    /// Orders ready tasks.
    pub queue: Arc<dyn SchedulerQueue>,
    /// Decides who retries a retryable failure.
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Receives profiling data.
    pub profile: Arc<dyn ProfileCollector>,
    /// Told about every new transaction.
    pub access: Arc<dyn AccessCoordinator>,
}

/// Snapshot of scheduler load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Consumer threads still taking tasks.
    pub consumer_threads: usize,
    /// Tasks ready in the backing queue.
    pub ready_tasks: usize,
    /// Tasks waiting behind another task of a dependent queue.
    pub dependent_tasks: usize,
    /// Whether shutdown has started.
    pub shutdown: bool,
}

/// State shared between the facade, its consumers and dependent queues.
pub(crate) struct SchedulerCore {
    pub(crate) transaction_coordinator: Arc<dyn TransactionCoordinator>,
    pub(crate) backing_queue: Arc<dyn SchedulerQueue>,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
    pub(crate) profile: Arc<dyn ProfileCollector>,
    pub(crate) access: Arc<dyn AccessCoordinator>,
    pub(crate) kernel_context: RwLock<Option<Arc<KernelContext>>>,
    /// Tasks waiting in dependent queues, for load reporting only.
    pub(crate) dependency_count: AtomicUsize,
    thread_count: AtomicUsize,
    shutdown: AtomicBool,
    shutdown_lock: Mutex<()>,
    consumers: Mutex<Vec<Interrupt>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerCore {
    fn new(parts: SchedulerParts) -> Self {
        Self {
            transaction_coordinator: parts.transaction_coordinator,
            backing_queue: parts.queue,
            retry_policy: parts.retry_policy,
            profile: parts.profile,
            access: parts.access,
            kernel_context: RwLock::new(None),
            dependency_count: AtomicUsize::new(0),
            thread_count: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            shutdown_lock: Mutex::new(()),
            consumers: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_running(&self) -> Result<(), SchedulerError> {
        if self.is_shutdown() {
            Err(SchedulerError::Shutdown)
        } else {
            Ok(())
        }
    }

    pub(crate) fn new_task(
        &self,
        runnable: Arc<dyn KernelRunnable>,
        owner: Identity,
        priority: Priority,
        start_time_ms: u128,
    ) -> ScheduledTask {
        ScheduledTask::new(
            runnable,
            owner,
            priority,
            start_time_ms,
            self.transaction_coordinator.default_timeout(),
        )
    }

    /// Idempotent. Interrupts every consumer and shuts the backing queue
    /// down; consumers are not joined here.
    pub(crate) fn shutdown(&self) {
        let _guard = self.shutdown_lock.lock();
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down transaction scheduler");
        for interrupt in self.consumers.lock().iter() {
            interrupt.interrupt();
        }
        self.backing_queue.shutdown();
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            consumer_threads: self.thread_count.load(Ordering::Acquire),
            ready_tasks: self.backing_queue.ready_count(),
            dependent_tasks: self.dependency_count.load(Ordering::Acquire),
            shutdown: self.is_shutdown(),
        }
    }
}

/// Runs tasks transactionally on a pool of consumer threads.
pub struct TransactionScheduler {
    core: Arc<SchedulerCore>,
}

impl TransactionScheduler {
    /// Create a scheduler and start `config.consumer_threads` consumers.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidConfig` if the configuration is invalid
    /// - `SchedulerError::Backend` if a consumer thread cannot be spawned
    pub fn new(config: &SchedulerConfig, parts: SchedulerParts) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        let core = Arc::new(SchedulerCore::new(parts));

        for consumer_id in 0..config.consumer_threads {
            if let Err(e) = consumer::spawn_consumer(&core, consumer_id) {
                core.shutdown();
                return Err(e);
            }
        }

        info!(
            consumer_threads = config.consumer_threads,
            default_timeout_ms = config.default_timeout_ms,
            "TransactionScheduler started"
        );
        Ok(Self { core })
    }

    /// Install the application context stamped into every task context.
    pub fn set_context(&self, context: KernelContext) {
        *self.core.kernel_context.write() = Some(Arc::new(context));
    }

    /// Reserve space for a task to start now.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Shutdown` after shutdown; otherwise whatever the
    /// backing queue reports.
    pub fn reserve_task(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: Identity,
    ) -> Result<Box<dyn TaskReservation>, SchedulerError> {
        self.reserve_task_with_priority(task, owner, Priority::default(), now_ms())
    }

    /// Reserve space for a task to start at `start_time_ms`.
    ///
    /// # Errors
    ///
    /// See [`TransactionScheduler::reserve_task`].
    pub fn reserve_task_at(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: Identity,
        start_time_ms: u128,
    ) -> Result<Box<dyn TaskReservation>, SchedulerError> {
        self.reserve_task_with_priority(task, owner, Priority::default(), start_time_ms)
    }

    /// Reserve space for a task with an explicit priority and start time.
    ///
    /// # Errors
    ///
    /// See [`TransactionScheduler::reserve_task`].
    pub fn reserve_task_with_priority(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: Identity,
        priority: Priority,
        start_time_ms: u128,
    ) -> Result<Box<dyn TaskReservation>, SchedulerError> {
        self.core.ensure_running()?;
        let scheduled = Arc::new(self.core.new_task(task, owner, priority, start_time_ms));
        self.core.backing_queue.reserve_task(scheduled)
    }

    /// Submit a task to run as soon as a consumer is free.
    ///
    /// The returned task can be used to observe the outcome or to cancel it.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Shutdown` after shutdown
    /// - `SchedulerError::TaskRejected` if the backing queue is full
    pub fn schedule_task(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: Identity,
    ) -> Result<Arc<ScheduledTask>, SchedulerError> {
        self.schedule_task_with_priority(task, owner, Priority::default(), now_ms())
    }

    /// Submit a task to run no earlier than `start_time_ms`.
    ///
    /// # Errors
    ///
    /// See [`TransactionScheduler::schedule_task`].
    pub fn schedule_task_at(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: Identity,
        start_time_ms: u128,
    ) -> Result<Arc<ScheduledTask>, SchedulerError> {
        self.schedule_task_with_priority(task, owner, Priority::default(), start_time_ms)
    }

    /// Submit a task with an explicit priority and start time.
    ///
    /// # Errors
    ///
    /// See [`TransactionScheduler::schedule_task`].
    pub fn schedule_task_with_priority(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: Identity,
        priority: Priority,
        start_time_ms: u128,
    ) -> Result<Arc<ScheduledTask>, SchedulerError> {
        self.core.ensure_running()?;
        let scheduled = Arc::new(self.core.new_task(task, owner, priority, start_time_ms));
        self.core.backing_queue.add_task(Arc::clone(&scheduled))?;
        Ok(scheduled)
    }

    /// Create a recurring task whose first occurrence starts at
    /// `start_time_ms` and then every `period_ms`.
    ///
    /// Nothing runs until the returned handle is started. Keep the handle:
    /// once it is dropped the recurrence can no longer be cancelled.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidArgument` if `period_ms` is zero
    /// - `SchedulerError::Shutdown` after shutdown
    pub fn schedule_recurring_task(
        &self,
        task: Arc<dyn KernelRunnable>,
        owner: Identity,
        start_time_ms: u128,
        period_ms: u128,
    ) -> Result<Arc<dyn RecurringTaskHandle>, SchedulerError> {
        if period_ms == 0 {
            return Err(SchedulerError::InvalidArgument("recurrence period must be positive".into()));
        }
        self.core.ensure_running()?;
        let scheduled = Arc::new(
            self.core
                .new_task(task, owner, Priority::default(), start_time_ms)
                .with_period(period_ms),
        );
        let handle = self.core.backing_queue.create_recurring_handle(Arc::clone(&scheduled))?;
        scheduled.set_recurring_handle(&handle);
        Ok(handle)
    }

    /// Cancel a submitted task that has not started running.
    ///
    /// Returns `false` if the task is running or already finished.
    pub fn cancel_task(&self, task: &Arc<ScheduledTask>) -> bool {
        if task.cancel(false) {
            self.core.backing_queue.notify_cancelled(task);
            true
        } else {
            false
        }
    }

    /// Create a queue whose tasks run one at a time, in the order added.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Shutdown` after shutdown.
    pub fn create_task_queue(&self) -> Result<DependentTaskQueue, SchedulerError> {
        self.core.ensure_running()?;
        Ok(DependentTaskQueue::new(&self.core))
    }

    /// Run a task and block until it finishes.
    ///
    /// Inside a transaction the body runs directly in the caller's
    /// transaction. Otherwise the attempt (and any in-place retries) runs on
    /// the calling thread in a new transaction.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Shutdown` after shutdown, or if shutdown dropped
    ///   the task while it waited in the backing queue for a retry
    /// - `SchedulerError::Interrupted` if `ctx` was interrupted before the
    ///   task finished; the task is cancelled when possible
    /// - `SchedulerError::Task` with the cause the task finished with
    pub fn run_task(
        &self,
        ctx: &ExecutionContext,
        task: Arc<dyn KernelRunnable>,
        owner: Identity,
    ) -> Result<(), SchedulerError> {
        self.core.ensure_running()?;
        if ctx.is_in_transaction() {
            return task.run(ctx).map_err(SchedulerError::Task);
        }
        let scheduled = Arc::new(self.core.new_task(task, owner, Priority::default(), now_ms()));
        self.core.wait_for_task(&scheduled, ctx, false)
    }

    /// Run a task under the unbounded transaction timeout and block until it
    /// finishes. Meant for one-time bootstrap work.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InTransaction` if `ctx` is inside a transaction
    /// - otherwise as [`TransactionScheduler::run_task`]
    pub fn run_unbounded_task(
        &self,
        ctx: &ExecutionContext,
        task: Arc<dyn KernelRunnable>,
        owner: Identity,
    ) -> Result<(), SchedulerError> {
        self.core.ensure_running()?;
        if ctx.is_in_transaction() {
            return Err(SchedulerError::InTransaction);
        }
        let scheduled = Arc::new(self.core.new_task(task, owner, Priority::default(), now_ms()));
        self.core.wait_for_task(&scheduled, ctx, true)
    }

    /// Stop accepting tasks, interrupt every consumer and shut down the
    /// backing queue. Idempotent.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    /// Whether shutdown has started.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }

    /// Current load.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.core.stats()
    }

    /// Wait up to `timeout` for every consumer thread to exit.
    ///
    /// Returns `true` once no consumer is left. Consumers that do not exit
    /// in time are detached.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let workers: Vec<JoinHandle<()>> = self.core.workers.lock().drain(..).collect();

        for worker in workers {
            let name = worker.thread().name().unwrap_or("unnamed").to_string();
            let (tx, rx) = bounded(1);
            thread::spawn(move || {
                let _ = tx.send(worker.join().is_ok());
            });

            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(true) => debug!(consumer = %name, "Consumer joined"),
                Ok(false) => warn!(consumer = %name, "Consumer panicked"),
                Err(_) => warn!(consumer = %name, "Consumer did not exit within timeout - detaching"),
            }
        }

        self.core.thread_count.load(Ordering::Acquire) == 0
    }
}

impl Drop for TransactionScheduler {
    fn drop(&mut self) {
        if !self.core.is_shutdown() {
            debug!("TransactionScheduler dropped without explicit shutdown");
            self.core.shutdown();
        }
    }
}
