//! Infrastructure adapters: backing queues, retry policies and transaction
//! coordinators.

pub mod queue;
pub mod retry;
pub mod transaction;

pub use queue::{InMemorySchedulerQueue, QueueOrdering};
pub use retry::{ImmediateRetryPolicy, NowOrLaterRetryPolicy};
pub use transaction::InMemoryTransactionCoordinator;
