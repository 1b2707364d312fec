//! Shared value types used across the scheduler.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier assigned to every scheduled task.
pub type TaskId = u64;

/// Priority hint handed to the backing ordering queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default priority for submitted tasks.
    #[default]
    Normal,
    /// Latency-sensitive work.
    High,
    /// Must run before anything else that is ready.
    Critical,
}

impl Priority {
    /// Numeric rank, higher runs first.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

/// The principal on whose behalf a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    name: String,
}

impl Identity {
    /// Create an identity with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Identity used for work the system performs on its own behalf.
    #[must_use]
    pub fn system() -> Self {
        Self::new("system")
    }

    /// The identity's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
