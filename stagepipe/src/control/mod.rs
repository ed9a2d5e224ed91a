//! Run-wide control primitives shared by every stage worker.
//!
//! This module provides:
//! - `ShutdownFlag` for cooperative, monotonic cancellation
//! - `ErrorSink` collecting worker faults in arrival order
//! - `CompletionCounter` deciding which worker of a stage finishes last

mod counter;
mod error_sink;
mod shutdown;

pub use counter::{Arrival, CompletionCounter};
pub use error_sink::ErrorSink;
pub use shutdown::ShutdownFlag;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which workers a primitive has to be visible to.
///
/// `Process` is selected whenever an isolated (multiprocess) task takes part,
/// `Thread` otherwise. The scope is a label fixed when the primitive is
/// created and reported in logs; it does not select a different primitive.
/// Isolated workers run on threads of this process, so both scopes share
/// the same atomics and locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Only in-process worker threads or tasks participate.
    #[default]
    Thread,
    /// Isolated workers participate.
    Process,
}

impl Scope {
    /// Picks the scope for a single multiprocess flag.
    #[must_use]
    pub const fn for_multiprocess(multiprocess: bool) -> Self {
        if multiprocess {
            Self::Process
        } else {
            Self::Thread
        }
    }

    /// Picks the widest scope required by any of the given flags.
    #[must_use]
    pub fn widest(flags: impl IntoIterator<Item = bool>) -> Self {
        Self::for_multiprocess(flags.into_iter().any(|flag| flag))
    }

    /// Returns true for the process-wide scope.
    #[must_use]
    pub const fn is_process(self) -> bool {
        matches!(self, Self::Process)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
        }
    }
}
