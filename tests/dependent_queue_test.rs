//! Integration tests for DependentTaskQueue
//!
//! Verifies that tasks added to one queue run strictly in order and one at a
//! time, that only the head of a queue is ever submitted to the backing
//! queue, and that unrelated queues keep running concurrently.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use rand::Rng;

use txn_scheduler::builders::SchedulerBuilder;
use txn_scheduler::config::SchedulerConfig;
use txn_scheduler::core::{
    ExecutionContext, Interrupted, NamedTask, RecurringTaskHandle, ScheduledTask, SchedulerError, SchedulerQueue,
    TaskReservation,
};
use txn_scheduler::infra::queue::{InMemorySchedulerQueue, QueueOrdering};
use txn_scheduler::util::serde::Identity;

// ============================================================================
// HELPERS
// ============================================================================

fn config(consumers: usize) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_consumer_threads(consumers)
        .with_default_timeout_ms(10_000)
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn owner() -> Identity {
    Identity::new("tester")
}

/// Backing queue that records the name of every task submitted to it.
struct RecordingQueue {
    inner: InMemorySchedulerQueue,
    added: Mutex<Vec<String>>,
}

impl RecordingQueue {
    fn new() -> Self {
        Self {
            inner: InMemorySchedulerQueue::new(QueueOrdering::Fifo, 1024),
            added: Mutex::new(Vec::new()),
        }
    }

    fn added(&self) -> Vec<String> {
        self.added.lock().clone()
    }
}

impl SchedulerQueue for RecordingQueue {
    fn ready_count(&self) -> usize {
        self.inner.ready_count()
    }

    fn next_task(&self, wait: bool) -> Result<Option<Arc<ScheduledTask>>, Interrupted> {
        self.inner.next_task(wait)
    }

    fn reserve_task(&self, task: Arc<ScheduledTask>) -> Result<Box<dyn TaskReservation>, SchedulerError> {
        self.inner.reserve_task(task)
    }

    fn add_task(&self, task: Arc<ScheduledTask>) -> Result<(), SchedulerError> {
        self.added.lock().push(task.runnable().base_type().to_string());
        self.inner.add_task(task)
    }

    fn create_recurring_handle(
        &self,
        task: Arc<ScheduledTask>,
    ) -> Result<Arc<dyn RecurringTaskHandle>, SchedulerError> {
        self.inner.create_recurring_handle(task)
    }

    fn notify_cancelled(&self, task: &Arc<ScheduledTask>) {
        self.inner.notify_cancelled(task);
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}

// ============================================================================
// ORDERING
// ============================================================================

#[test]
fn test_tasks_run_in_order_one_at_a_time() {
    const TASKS: usize = 20;
    let scheduler = SchedulerBuilder::new(config(4)).build().unwrap();
    let queue = scheduler.create_task_queue().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));

    for i in 0..TASKS {
        let order = Arc::clone(&order);
        let running = Arc::clone(&running);
        let max_running = Arc::clone(&max_running);
        let jitter = rand::rng().random_range(0..3u64);
        queue
            .add_task(
                NamedTask::shared(format!("step-{i}"), move |_ctx: &ExecutionContext| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(jitter));
                    order.lock().push(i);
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }),
                owner(),
            )
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || order.lock().len() == TASKS));
    assert_eq!(*order.lock(), (0..TASKS).collect::<Vec<_>>());
    assert_eq!(max_running.load(Ordering::SeqCst), 1);
    assert!(wait_until(Duration::from_secs(5), || !queue.is_active()));
    assert_eq!(queue.pending(), 0);

    scheduler.shutdown();
}

#[test]
fn test_successor_not_submitted_before_predecessor_finishes() {
    let backing = Arc::new(RecordingQueue::new());
    let scheduler = SchedulerBuilder::new(config(2))
        .with_queue(backing.clone())
        .build()
        .unwrap();
    let queue = scheduler.create_task_queue().unwrap();

    let (started_tx, started_rx) = bounded::<()>(1);
    let (release_tx, release_rx) = bounded::<()>(1);
    let (finished_tx, finished_rx) = bounded::<&'static str>(3);

    let finished = finished_tx.clone();
    queue
        .add_task(
            NamedTask::shared("A", move |_ctx: &ExecutionContext| {
                let _ = started_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(10));
                let _ = finished.send("A");
                Ok(())
            }),
            owner(),
        )
        .unwrap();
    for name in ["B", "C"] {
        let finished = finished_tx.clone();
        queue
            .add_task(
                NamedTask::shared(name, move |_ctx: &ExecutionContext| {
                    let _ = finished.send(name);
                    Ok(())
                }),
                owner(),
            )
            .unwrap();
    }

    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(backing.added(), vec!["A".to_string()]);
    assert_eq!(queue.pending(), 2);
    assert_eq!(scheduler.stats().dependent_tasks, 2);

    release_tx.send(()).unwrap();
    let finished: Vec<&str> = (0..3)
        .map(|_| finished_rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    assert_eq!(finished, vec!["A", "B", "C"]);
    assert!(wait_until(Duration::from_secs(5), || backing.added().len() == 3));
    assert_eq!(backing.added(), vec!["A", "B", "C"]);
    assert_eq!(scheduler.stats().dependent_tasks, 0);

    scheduler.shutdown();
}

#[test]
fn test_failed_task_still_advances_queue() {
    let scheduler = SchedulerBuilder::new(config(1)).build().unwrap();
    let queue = scheduler.create_task_queue().unwrap();
    let (done_tx, done_rx) = bounded::<()>(1);

    queue
        .add_task(
            NamedTask::shared("fails", |_ctx: &ExecutionContext| {
                Err(txn_scheduler::core::TaskError::fatal(anyhow::anyhow!("broken step")))
            }),
            owner(),
        )
        .unwrap();
    queue
        .add_task(
            NamedTask::shared("next", move |_ctx: &ExecutionContext| {
                let _ = done_tx.send(());
                Ok(())
            }),
            owner(),
        )
        .unwrap();

    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    scheduler.shutdown();
}

// ============================================================================
// CONCURRENCY ACROSS QUEUES
// ============================================================================

#[test]
fn test_unrelated_queues_are_not_serialized() {
    let scheduler = SchedulerBuilder::new(config(2)).build().unwrap();
    let blocked = scheduler.create_task_queue().unwrap();
    let free = scheduler.create_task_queue().unwrap();

    let (release_tx, release_rx) = bounded::<()>(1);
    let (free_tx, free_rx) = bounded::<()>(1);

    blocked
        .add_task(
            NamedTask::shared("blocked", move |_ctx: &ExecutionContext| {
                let _ = release_rx.recv_timeout(Duration::from_secs(10));
                Ok(())
            }),
            owner(),
        )
        .unwrap();
    free.add_task(
        NamedTask::shared("free", move |_ctx: &ExecutionContext| {
            let _ = free_tx.send(());
            Ok(())
        }),
        owner(),
    )
    .unwrap();

    // The second queue makes progress while the first one is held.
    free_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(blocked.is_active());

    release_tx.send(()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !blocked.is_active()));
    scheduler.shutdown();
}

#[test]
fn test_queue_rejects_tasks_after_shutdown() {
    let scheduler = SchedulerBuilder::new(config(1)).build().unwrap();
    let queue = scheduler.create_task_queue().unwrap();
    scheduler.shutdown();

    let result = queue.add_task(NamedTask::shared("late", |_ctx: &ExecutionContext| Ok(())), owner());
    assert!(matches!(result, Err(SchedulerError::Shutdown)));

    drop(scheduler);
    let result = queue.add_task(NamedTask::shared("orphan", |_ctx: &ExecutionContext| Ok(())), owner());
    assert!(matches!(result, Err(SchedulerError::Shutdown)));
}
