//! Error types for scheduler operations and task failures.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Capability exposed by failures that know whether they should be retried.
pub trait RetryStatus {
    /// Returns `true` if the failed attempt should be tried again.
    fn should_retry(&self) -> bool;
}

/// Failure cause of one task attempt.
///
/// Cloning is cheap, so a finished task can report the same cause to every
/// thread that asks for it.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The attempt observed an interruption of the thread running it.
    #[error("task was interrupted")]
    Interrupted,
    /// The task was cancelled before it could finish.
    #[error("task was cancelled")]
    Cancelled,
    /// The transaction exceeded its timeout.
    #[error("transaction timed out after {0:?}")]
    Timeout(Duration),
    /// The task body (or its transaction) failed.
    #[error("{error}")]
    Failed {
        /// The underlying application failure.
        error: Arc<anyhow::Error>,
        /// Whether the failure asks to be retried.
        retry: bool,
    },
}

impl TaskError {
    /// A failure that should be retried.
    pub fn retryable(error: impl Into<anyhow::Error>) -> Self {
        Self::Failed {
            error: Arc::new(error.into()),
            retry: true,
        }
    }

    /// A failure that ends the current occurrence of the task.
    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        Self::Failed {
            error: Arc::new(error.into()),
            retry: false,
        }
    }

    /// Whether this failure is an interruption.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

impl RetryStatus for TaskError {
    fn should_retry(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Failed { retry, .. } => *retry,
            Self::Interrupted | Self::Cancelled => false,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        Self::fatal(error)
    }
}

/// Returned by blocking operations when the calling thread was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler has been shut down.
    #[error("scheduler is shut down")]
    Shutdown,
    /// The backing queue refused the task.
    #[error("task rejected: {0}")]
    TaskRejected(String),
    /// The caller was interrupted while waiting for a task.
    #[error("interrupted while waiting for task")]
    Interrupted,
    /// The operation is not allowed inside an active transaction.
    #[error("cannot be called from within an active transaction")]
    InTransaction,
    /// The task failed permanently.
    #[error("task failed: {0}")]
    Task(#[from] TaskError),
    /// A handle or reservation was used in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// An argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<Interrupted> for SchedulerError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_status() {
        assert!(TaskError::retryable(anyhow::anyhow!("conflict")).should_retry());
        assert!(!TaskError::fatal(anyhow::anyhow!("bad input")).should_retry());
        assert!(TaskError::Timeout(Duration::from_millis(5)).should_retry());
        assert!(!TaskError::Interrupted.should_retry());
        assert!(!TaskError::Cancelled.should_retry());
    }

    #[test]
    fn test_anyhow_converts_to_fatal() {
        let err: TaskError = anyhow::anyhow!("boom").into();
        assert!(!err.should_retry());
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_scheduler_error_display() {
        assert_eq!(SchedulerError::Shutdown.to_string(), "scheduler is shut down");
        assert_eq!(
            SchedulerError::TaskRejected("queue full".into()).to_string(),
            "task rejected: queue full"
        );
        let err: SchedulerError = TaskError::Cancelled.into();
        assert_eq!(err.to_string(), "task failed: task was cancelled");
        let err: SchedulerError = Interrupted.into();
        assert!(matches!(err, SchedulerError::Interrupted));
    }

    #[test]
    fn test_task_error_clone_shares_cause() {
        let err = TaskError::fatal(anyhow::anyhow!("once"));
        let copy = err.clone();
        match (&err, &copy) {
            (TaskError::Failed { error: a, .. }, TaskError::Failed { error: b, .. }) => {
                assert!(Arc::ptr_eq(a, b));
            }
            _ => panic!("expected failed variants"),
        }
    }
}
