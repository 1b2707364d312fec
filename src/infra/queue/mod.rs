//! Backing ordering queues.

pub mod memory;

pub use memory::{InMemorySchedulerQueue, QueueOrdering};
