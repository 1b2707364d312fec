//! Transaction coordinators.

pub mod memory;

pub use memory::InMemoryTransactionCoordinator;
