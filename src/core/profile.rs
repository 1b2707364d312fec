//! Profile collectors.
//!
//! The scheduler reports consumer threads joining and leaving, every task
//! attempt it starts and finishes, and the transaction each attempt runs in.
//! Provides a no-op collector and a bounded in-memory one for tests and dev.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::core::{TaskError, TransactionId};
use crate::util::clock::now_ms;
use crate::util::serde::Identity;

/// Receives scheduler profiling data.
pub trait ProfileCollector: Send + Sync {
    /// A consumer thread started taking tasks.
    fn notify_thread_added(&self);
    /// A consumer thread stopped taking tasks.
    fn notify_thread_removed(&self);
    /// An attempt of a task is starting.
    fn start_task(&self, task_type: &str, owner: &Identity, scheduled_start_ms: u128, ready_count: usize);
    /// The current attempt runs in this transaction.
    fn note_transactional(&self, transaction: TransactionId);
    /// The current attempt finished, with `failure` unless it succeeded.
    fn finish_task(&self, try_count: u32, failure: Option<&TaskError>);
}

/// Collector that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProfileCollector;

impl ProfileCollector for NoopProfileCollector {
    fn notify_thread_added(&self) {}
    fn notify_thread_removed(&self) {}
    fn start_task(&self, _task_type: &str, _owner: &Identity, _scheduled_start_ms: u128, _ready_count: usize) {}
    fn note_transactional(&self, _transaction: TransactionId) {}
    fn finish_task(&self, _try_count: u32, _failure: Option<&TaskError>) {}
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileAction {
    /// A consumer thread joined.
    ThreadAdded,
    /// A consumer thread left.
    ThreadRemoved,
    /// An attempt started.
    TaskStarted {
        /// Description of the task body.
        task_type: String,
        /// Owner of the task.
        owner: Identity,
        /// Requested start time (ms since epoch).
        scheduled_start_ms: u128,
        /// Ready plus dependent backlog when the attempt started.
        ready_count: usize,
    },
    /// The attempt runs in a transaction.
    Transactional {
        /// The transaction.
        transaction: TransactionId,
    },
    /// An attempt finished.
    TaskFinished {
        /// Attempts made so far, including this one.
        try_count: u32,
        /// Failure message, `None` on success.
        failure: Option<String>,
    },
}

/// One recorded profile event.
#[derive(Debug, Clone)]
pub struct ProfileEvent {
    /// Name of the thread that reported the event.
    pub thread: String,
    /// The reported action.
    pub action: ProfileAction,
    /// Timestamp milliseconds.
    pub recorded_at_ms: u128,
}

/// In-memory collector with a bounded buffer.
pub struct InMemoryProfileCollector {
    events: Mutex<VecDeque<ProfileEvent>>,
    max_events: usize,
}

impl InMemoryProfileCollector {
    /// Create a collector keeping at most `max_events` events.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<ProfileEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Snapshot of the recorded actions only.
    #[must_use]
    pub fn actions(&self) -> Vec<ProfileAction> {
        self.events.lock().iter().map(|e| e.action.clone()).collect()
    }

    /// Transactions noted so far, in order.
    #[must_use]
    pub fn transactions(&self) -> Vec<TransactionId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e.action {
                ProfileAction::Transactional { transaction } => Some(transaction),
                _ => None,
            })
            .collect()
    }

    fn record(&self, action: ProfileAction) {
        let event = ProfileEvent {
            thread: std::thread::current().name().unwrap_or("unnamed").to_string(),
            action,
            recorded_at_ms: now_ms(),
        };
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

impl ProfileCollector for InMemoryProfileCollector {
    fn notify_thread_added(&self) {
        self.record(ProfileAction::ThreadAdded);
    }

    fn notify_thread_removed(&self) {
        self.record(ProfileAction::ThreadRemoved);
    }

    fn start_task(&self, task_type: &str, owner: &Identity, scheduled_start_ms: u128, ready_count: usize) {
        self.record(ProfileAction::TaskStarted {
            task_type: task_type.to_string(),
            owner: owner.clone(),
            scheduled_start_ms,
            ready_count,
        });
    }

    fn note_transactional(&self, transaction: TransactionId) {
        self.record(ProfileAction::Transactional { transaction });
    }

    fn finish_task(&self, try_count: u32, failure: Option<&TaskError>) {
        self.record(ProfileAction::TaskFinished {
            try_count,
            failure: failure.map(ToString::to_string),
        });
    }
}
