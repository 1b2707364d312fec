//! In-memory backing queue with priority ordering and delayed start.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::core::{
    Interrupted, RecurringTaskHandle, ScheduledTask, SchedulerError, SchedulerQueue, TaskReservation,
};
use crate::util::clock::now_ms;

/// How ready tasks are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrdering {
    /// Submission order.
    #[default]
    Fifo,
    /// Highest priority first, submission order within a priority.
    Priority,
}

/// Ready task, orderable by rank (highest first) then sequence (lowest first).
struct ReadyEntry {
    rank: u8,
    seq: u64,
    task: Arc<ScheduledTask>,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed sequence so the max-heap pops the oldest entry first.
        self.rank.cmp(&other.rank).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Task waiting for its start time, orderable so the earliest pops first.
struct DelayedEntry {
    start_ms: u128,
    seq: u64,
    task: Arc<ScheduledTask>,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .start_ms
            .cmp(&self.start_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    reserved: usize,
    next_seq: u64,
    shutdown: bool,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.reserved
    }

    /// Move every delayed entry whose start time has passed to the ready heap.
    fn promote_due(&mut self, ordering: QueueOrdering, now: u128) {
        while self.delayed.peek().is_some_and(|entry| entry.start_ms <= now) {
            if let Some(entry) = self.delayed.pop() {
                self.ready.push(ReadyEntry {
                    rank: rank_for(ordering, &entry.task),
                    seq: entry.seq,
                    task: entry.task,
                });
            }
        }
    }
}

fn rank_for(ordering: QueueOrdering, task: &ScheduledTask) -> u8 {
    match ordering {
        QueueOrdering::Fifo => 0,
        QueueOrdering::Priority => task.priority().rank(),
    }
}

struct QueueShared {
    ordering: QueueOrdering,
    max_depth: usize,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl QueueShared {
    fn admit(&self, state: &QueueState) -> Result<(), SchedulerError> {
        if state.shutdown {
            return Err(SchedulerError::Shutdown);
        }
        if state.depth() >= self.max_depth {
            return Err(SchedulerError::TaskRejected("max queue depth reached".into()));
        }
        Ok(())
    }

    fn push(&self, state: &mut QueueState, task: Arc<ScheduledTask>) {
        let seq = state.next_seq;
        state.next_seq += 1;
        let start_ms = task.start_time_ms();
        if start_ms <= now_ms() {
            state.ready.push(ReadyEntry {
                rank: rank_for(self.ordering, &task),
                seq,
                task,
            });
        } else {
            state.delayed.push(DelayedEntry { start_ms, seq, task });
        }
        self.available.notify_one();
    }

    fn release_reservation(&self) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
    }
}

/// In-memory [`SchedulerQueue`].
///
/// Tasks become ready at their requested start time; blocked consumers sleep
/// until the earliest start time rather than polling. Cancelled tasks and
/// occurrences of cancelled recurrences are discarded instead of handed out.
pub struct InMemorySchedulerQueue {
    shared: Arc<QueueShared>,
}

impl InMemorySchedulerQueue {
    /// Create a queue holding at most `max_depth` tasks, reservations included.
    #[must_use]
    pub fn new(ordering: QueueOrdering, max_depth: usize) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                ordering,
                max_depth,
                state: Mutex::new(QueueState {
                    ready: BinaryHeap::with_capacity(max_depth.min(1024)),
                    delayed: BinaryHeap::new(),
                    reserved: 0,
                    next_seq: 0,
                    shutdown: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Ordering this queue was created with.
    #[must_use]
    pub fn ordering(&self) -> QueueOrdering {
        self.shared.ordering
    }

    /// Tasks held, ready or delayed, plus outstanding reservations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().depth()
    }

    /// Whether the queue holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SchedulerQueue for InMemorySchedulerQueue {
    fn ready_count(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.promote_due(self.shared.ordering, now_ms());
        state.ready.len()
    }

    fn next_task(&self, wait: bool) -> Result<Option<Arc<ScheduledTask>>, Interrupted> {
        let mut state = self.shared.state.lock();
        loop {
            if state.shutdown {
                return Err(Interrupted);
            }
            state.promote_due(self.shared.ordering, now_ms());

            while let Some(entry) = state.ready.pop() {
                if entry.task.is_cancelled() || entry.task.is_recurrence_cancelled() {
                    trace!(task = %entry.task, "Discarding cancelled task");
                    continue;
                }
                if !state.ready.is_empty() {
                    self.shared.available.notify_one();
                }
                return Ok(Some(entry.task));
            }

            if !wait {
                return Ok(None);
            }
            match state.delayed.peek().map(|entry| entry.start_ms) {
                Some(start_ms) => {
                    let delay = start_ms.saturating_sub(now_ms());
                    let delay = Duration::from_millis(u64::try_from(delay).unwrap_or(u64::MAX));
                    self.shared.available.wait_for(&mut state, delay);
                }
                None => self.shared.available.wait(&mut state),
            }
        }
    }

    fn reserve_task(&self, task: Arc<ScheduledTask>) -> Result<Box<dyn TaskReservation>, SchedulerError> {
        let mut state = self.shared.state.lock();
        self.shared.admit(&state)?;
        state.reserved += 1;
        Ok(Box::new(MemoryReservation {
            shared: Arc::clone(&self.shared),
            task: Some(task),
        }))
    }

    fn add_task(&self, task: Arc<ScheduledTask>) -> Result<(), SchedulerError> {
        let mut state = self.shared.state.lock();
        self.shared.admit(&state)?;
        self.shared.push(&mut state, task);
        Ok(())
    }

    fn create_recurring_handle(
        &self,
        task: Arc<ScheduledTask>,
    ) -> Result<Arc<dyn RecurringTaskHandle>, SchedulerError> {
        if self.shared.state.lock().shutdown {
            return Err(SchedulerError::Shutdown);
        }
        Ok(Arc::new(MemoryRecurringHandle {
            shared: Arc::clone(&self.shared),
            pending: Mutex::new(Some(task)),
            cancelled: AtomicBool::new(false),
        }))
    }

    fn notify_cancelled(&self, task: &Arc<ScheduledTask>) {
        let mut state = self.shared.state.lock();
        state.ready.retain(|entry| !Arc::ptr_eq(&entry.task, task));
        state.delayed.retain(|entry| !Arc::ptr_eq(&entry.task, task));
    }

    fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        let dropped = state.ready.len() + state.delayed.len();
        // Dropped tasks are finished as cancelled so nobody waits on them forever.
        for entry in state.ready.drain() {
            entry.task.cancel(true);
        }
        for entry in state.delayed.drain() {
            entry.task.cancel(true);
        }
        self.shared.available.notify_all();
        info!(dropped, "In-memory scheduler queue shut down");
    }
}

/// Slot held for a task until it is submitted or given back.
struct MemoryReservation {
    shared: Arc<QueueShared>,
    task: Option<Arc<ScheduledTask>>,
}

impl TaskReservation for MemoryReservation {
    fn use_reservation(mut self: Box<Self>) {
        let Some(task) = self.task.take() else {
            return;
        };
        let mut state = self.shared.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
        if state.shutdown {
            debug!(task = %task, "Reservation used after shutdown, dropping task");
            task.cancel(true);
            return;
        }
        self.shared.push(&mut state, task);
    }

    fn cancel(mut self: Box<Self>) {
        if self.task.take().is_some() {
            self.shared.release_reservation();
        }
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if self.task.take().is_some() {
            self.shared.release_reservation();
        }
    }
}

/// Recurrence control for a task submitted through [`InMemorySchedulerQueue`].
struct MemoryRecurringHandle {
    shared: Arc<QueueShared>,
    pending: Mutex<Option<Arc<ScheduledTask>>>,
    cancelled: AtomicBool,
}

impl RecurringTaskHandle for MemoryRecurringHandle {
    fn start(&self) -> Result<(), SchedulerError> {
        if self.is_cancelled() {
            return Err(SchedulerError::InvalidState("recurring task was cancelled".into()));
        }
        let task = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| SchedulerError::InvalidState("recurring task already started".into()))?;

        let mut state = self.shared.state.lock();
        if let Err(e) = self.shared.admit(&state) {
            drop(state);
            warn!(task = %task, error = %e, "Could not start recurring task");
            *self.pending.lock() = Some(task);
            return Err(e);
        }
        self.shared.push(&mut state, task);
        Ok(())
    }

    fn cancel(&self) -> Result<(), SchedulerError> {
        if self.cancelled.swap(true, AtomicOrdering::AcqRel) {
            return Err(SchedulerError::InvalidState("recurring task already cancelled".into()));
        }
        self.pending.lock().take();
        let mut state = self.shared.state.lock();
        state.ready.retain(|entry| !entry.task.is_recurrence_cancelled());
        state.delayed.retain(|entry| !entry.task.is_recurrence_cancelled());
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}
