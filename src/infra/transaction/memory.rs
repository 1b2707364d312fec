//! In-memory transaction coordinator.
//!
//! Transactions hold no data; they track abort state and enforce their
//! timeout when committed, which is enough to drive the scheduler's retry
//! machinery in tests and single-process deployments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::config::SchedulerConfig;
use crate::core::{TaskError, Transaction, TransactionCoordinator, TransactionHandle, TransactionId, TransactionTimeout};

/// Transaction tracked by [`InMemoryTransactionCoordinator`].
#[derive(Debug)]
pub struct MemoryTransaction {
    id: TransactionId,
    started: Instant,
    timeout: Duration,
    abort_cause: Mutex<Option<TaskError>>,
}

impl MemoryTransaction {
    fn new(timeout: Duration) -> Self {
        Self {
            id: TransactionId::new(),
            started: Instant::now(),
            timeout,
            abort_cause: Mutex::new(None),
        }
    }

    /// Timeout this transaction was created with.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Transaction for MemoryTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn is_aborted(&self) -> bool {
        self.abort_cause.lock().is_some()
    }

    fn abort(&self, cause: TaskError) {
        let mut slot = self.abort_cause.lock();
        if slot.is_none() {
            trace!(transaction = %self.id, cause = %cause, "Transaction aborted");
            *slot = Some(cause);
        }
    }

    fn abort_cause(&self) -> Option<TaskError> {
        self.abort_cause.lock().clone()
    }

    fn check_timeout(&self) -> Result<(), TaskError> {
        if self.started.elapsed() > self.timeout {
            let cause = TaskError::Timeout(self.timeout);
            self.abort(cause.clone());
            return Err(cause);
        }
        Ok(())
    }
}

struct MemoryTransactionHandle {
    transaction: Arc<MemoryTransaction>,
}

impl TransactionHandle for MemoryTransactionHandle {
    fn transaction(&self) -> Arc<dyn Transaction> {
        Arc::clone(&self.transaction) as Arc<dyn Transaction>
    }

    fn commit(self: Box<Self>) -> Result<(), TaskError> {
        if let Some(cause) = self.transaction.abort_cause() {
            return Err(cause);
        }
        self.transaction.check_timeout()?;
        trace!(transaction = %self.transaction.id, "Transaction committed");
        Ok(())
    }
}

/// Coordinator issuing [`MemoryTransaction`]s.
pub struct InMemoryTransactionCoordinator {
    default_timeout: Duration,
    unbounded_timeout: Duration,
    created: AtomicU64,
    last_timeout: Mutex<Option<TransactionTimeout>>,
}

impl InMemoryTransactionCoordinator {
    /// Create a coordinator with the given bounded and unbounded timeouts.
    #[must_use]
    pub fn new(default_timeout: Duration, unbounded_timeout: Duration) -> Self {
        Self {
            default_timeout,
            unbounded_timeout,
            created: AtomicU64::new(0),
            last_timeout: Mutex::new(None),
        }
    }

    /// Create a coordinator using the timeouts in `config`.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.default_timeout_ms),
            Duration::from_millis(config.unbounded_timeout_ms),
        )
    }

    /// Transactions created so far.
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Acquire)
    }

    /// Timeout requested for the most recent transaction.
    #[must_use]
    pub fn last_timeout(&self) -> Option<TransactionTimeout> {
        *self.last_timeout.lock()
    }
}

impl TransactionCoordinator for InMemoryTransactionCoordinator {
    fn create_transaction(&self, timeout: TransactionTimeout) -> Box<dyn TransactionHandle> {
        let limit = match timeout {
            TransactionTimeout::Bounded(limit) => limit,
            TransactionTimeout::Unbounded => self.unbounded_timeout,
        };
        self.created.fetch_add(1, Ordering::AcqRel);
        *self.last_timeout.lock() = Some(timeout);
        Box::new(MemoryTransactionHandle {
            transaction: Arc::new(MemoryTransaction::new(limit)),
        })
    }

    fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}
