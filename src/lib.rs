//! # Transaction Scheduler
//!
//! Runs units of work as transactions on a fixed pool of consumer threads.
//!
//! Every attempt of a task runs inside a fresh transaction obtained from a
//! pluggable [`TransactionCoordinator`](core::TransactionCoordinator). A
//! failure that asks to be retried is either retried in place or handed back
//! to the backing ordering queue, as the configured
//! [`RetryPolicy`](core::RetryPolicy) decides; anything else finishes the
//! task (or skips one occurrence of a recurring task).
//!
//! ## Key Features
//!
//! - **Fire-and-forget submission** with priority and delayed start
//! - **Synchronous execution** on the caller's thread, joining the caller's
//!   transaction when there is one
//! - **Recurring tasks** controlled through a start/cancel handle
//! - **Dependent task queues** whose tasks run strictly one after another
//! - **Explicit execution context** carrying the owner, the current
//!   transaction and a cooperative interrupt token
//!
//! ```rust,ignore
//! use txn_scheduler::builders::SchedulerBuilder;
//! use txn_scheduler::config::SchedulerConfig;
//! use txn_scheduler::core::{ExecutionContext, NamedTask, TaskError};
//! use txn_scheduler::util::serde::Identity;
//!
//! let scheduler = SchedulerBuilder::new(SchedulerConfig::from_env()?).build()?;
//!
//! scheduler.schedule_task(
//!     NamedTask::shared("refresh", |ctx: &ExecutionContext| {
//!         ctx.check_interrupted()?;
//!         Ok::<(), TaskError>(())
//!     }),
//!     Identity::new("alice"),
//! )?;
//!
//! let queue = scheduler.create_task_queue()?;
//! queue.add_task(NamedTask::shared("first", |_ctx| Ok(())), Identity::new("alice"))?;
//! queue.add_task(NamedTask::shared("second", |_ctx| Ok(())), Identity::new("alice"))?;
//!
//! scheduler.shutdown();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions, task state machine and scheduler facade.
pub mod core;
/// Configuration models for the scheduler, its queue and retry policy.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Infrastructure adapters for queues, retry policies and transactions.
pub mod infra;
/// Shared utilities.
pub mod util;
