//! Builders to construct a scheduler from configuration.

use std::sync::Arc;

use crate::config::{QueueBackendConfig, RetryPolicyConfig, SchedulerConfig};
use crate::core::{
    AccessCoordinator, NoopAccessCoordinator, NoopProfileCollector, ProfileCollector, RetryPolicy, SchedulerError,
    SchedulerParts, SchedulerQueue, TransactionCoordinator, TransactionScheduler,
};
use crate::infra::queue::{InMemorySchedulerQueue, QueueOrdering};
use crate::infra::retry::{ImmediateRetryPolicy, NowOrLaterRetryPolicy};
use crate::infra::transaction::InMemoryTransactionCoordinator;

/// Build the backing ordering queue selected by `cfg`.
#[must_use]
pub fn build_scheduler_queue(cfg: &SchedulerConfig) -> Arc<dyn SchedulerQueue> {
    let ordering = match cfg.queue {
        QueueBackendConfig::Fifo => QueueOrdering::Fifo,
        QueueBackendConfig::Priority => QueueOrdering::Priority,
    };
    Arc::new(InMemorySchedulerQueue::new(ordering, cfg.max_queue_depth))
}

/// Build the retry policy selected by `cfg`.
#[must_use]
pub fn build_retry_policy(cfg: &SchedulerConfig) -> Arc<dyn RetryPolicy> {
    match cfg.retry {
        RetryPolicyConfig::Immediate => Arc::new(ImmediateRetryPolicy),
        RetryPolicyConfig::NowOrLater { threshold } => Arc::new(NowOrLaterRetryPolicy::new(threshold)),
    }
}

/// Assembles a [`TransactionScheduler`], defaulting every collaborator not
/// supplied explicitly.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    transaction_coordinator: Option<Arc<dyn TransactionCoordinator>>,
    queue: Option<Arc<dyn SchedulerQueue>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    profile: Option<Arc<dyn ProfileCollector>>,
    access: Option<Arc<dyn AccessCoordinator>>,
}

impl SchedulerBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            transaction_coordinator: None,
            queue: None,
            retry_policy: None,
            profile: None,
            access: None,
        }
    }

    /// Use `coordinator` instead of an in-memory one.
    #[must_use]
    pub fn with_transaction_coordinator(mut self, coordinator: Arc<dyn TransactionCoordinator>) -> Self {
        self.transaction_coordinator = Some(coordinator);
        self
    }

    /// Use `queue` instead of the configured one.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn SchedulerQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Use `policy` instead of the configured one.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Report profiling data to `profile`.
    #[must_use]
    pub fn with_profile_collector(mut self, profile: Arc<dyn ProfileCollector>) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Report new transactions to `access`.
    #[must_use]
    pub fn with_access_coordinator(mut self, access: Arc<dyn AccessCoordinator>) -> Self {
        self.access = Some(access);
        self
    }

    /// Build and start the scheduler.
    ///
    /// # Errors
    ///
    /// See [`TransactionScheduler::new`].
    pub fn build(self) -> Result<TransactionScheduler, SchedulerError> {
        let config = self.config;
        let parts = SchedulerParts {
            transaction_coordinator: self
                .transaction_coordinator
                .unwrap_or_else(|| Arc::new(InMemoryTransactionCoordinator::from_config(&config))),
            queue: self.queue.unwrap_or_else(|| build_scheduler_queue(&config)),
            retry_policy: self.retry_policy.unwrap_or_else(|| build_retry_policy(&config)),
            profile: self.profile.unwrap_or_else(|| Arc::new(NoopProfileCollector)),
            access: self.access.unwrap_or_else(|| Arc::new(NoopAccessCoordinator)),
        };
        TransactionScheduler::new(&config, parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NamedTask, ScheduledTask};
    use crate::util::clock::now_ms;
    use crate::util::serde::{Identity, Priority};
    use std::time::Duration;

    #[test]
    fn test_build_scheduler_queue_respects_depth() {
        let cfg = SchedulerConfig::default().with_max_queue_depth(1);
        let queue = build_scheduler_queue(&cfg);
        let task = || {
            Arc::new(ScheduledTask::new(
                NamedTask::shared("queued", |_ctx| Ok(())),
                Identity::new("tester"),
                Priority::default(),
                now_ms(),
                Duration::from_millis(100),
            ))
        };

        queue.add_task(task()).unwrap();
        assert!(matches!(queue.add_task(task()), Err(SchedulerError::TaskRejected(_))));
        assert_eq!(queue.ready_count(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = SchedulerBuilder::new(SchedulerConfig::default().with_consumer_threads(0)).build();
        assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    }

    #[test]
    fn test_build_with_overrides() {
        let coordinator = Arc::new(InMemoryTransactionCoordinator::new(
            Duration::from_millis(50),
            Duration::from_secs(60),
        ));
        let scheduler = SchedulerBuilder::new(SchedulerConfig::default().with_consumer_threads(1))
            .with_transaction_coordinator(coordinator.clone())
            .with_retry_policy(Arc::new(NowOrLaterRetryPolicy::new(2)))
            .build()
            .unwrap();

        scheduler
            .run_task(
                &crate::core::ExecutionContext::new(Identity::new("caller")),
                NamedTask::shared("probe", |_ctx| Ok(())),
                Identity::new("caller"),
            )
            .unwrap();
        assert_eq!(coordinator.created_count(), 1);

        scheduler.shutdown();
        assert!(scheduler.await_termination(Duration::from_secs(5)));
    }
}
