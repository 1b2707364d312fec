//! Contracts for the transaction and access coordinators.
//!
//! The scheduler drives transactions but does not implement them; these
//! traits are the boundary. `infra::transaction` provides an in-memory
//! coordinator.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::TaskError;

/// Identifier of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// A fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Timeout requested for a new transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionTimeout {
    /// The task's own timeout.
    Bounded(Duration),
    /// The coordinator's unbounded timeout, for one-time bootstrap work.
    Unbounded,
}

/// A running transaction.
pub trait Transaction: Send + Sync + fmt::Debug {
    /// Identifier of this transaction.
    fn id(&self) -> TransactionId;
    /// Whether the transaction has been aborted.
    fn is_aborted(&self) -> bool;
    /// Abort the transaction; the first cause wins.
    fn abort(&self, cause: TaskError);
    /// The cause passed to the first `abort`.
    fn abort_cause(&self) -> Option<TaskError>;
    /// Fail if the transaction has run past its timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Timeout`] once the timeout has elapsed.
    fn check_timeout(&self) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Coordinator-side handle used to finish a transaction.
pub trait TransactionHandle: Send {
    /// The transaction this handle controls.
    fn transaction(&self) -> Arc<dyn Transaction>;
    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// Returns the abort cause if the transaction cannot commit.
    fn commit(self: Box<Self>) -> Result<(), TaskError>;
}

/// Creates transactions.
pub trait TransactionCoordinator: Send + Sync {
    /// Begin a new transaction with the given timeout.
    fn create_transaction(&self, timeout: TransactionTimeout) -> Box<dyn TransactionHandle>;
    /// Timeout given to tasks that do not request one.
    fn default_timeout(&self) -> Duration;
}

/// Tracks data access so conflicting transactions can be detected.
pub trait AccessCoordinator: Send + Sync {
    /// A transaction has begun running a task attempt.
    fn notify_new_transaction(
        &self,
        transaction: &dyn Transaction,
        requested_start_ms: u128,
        try_count: u32,
    );
}

/// Access coordinator that tracks nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAccessCoordinator;

impl AccessCoordinator for NoopAccessCoordinator {
    fn notify_new_transaction(&self, _transaction: &dyn Transaction, _requested_start_ms: u128, _try_count: u32) {}
}
