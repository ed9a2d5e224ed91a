//! Per-stage completion counter.

use super::Scope;
use parking_lot::Mutex;

/// Outcome of a worker arriving at the completion counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// This worker was the last of its stage to finish.
    Last,
    /// Other workers of the stage are still running.
    Pending {
        /// Number of workers yet to arrive.
        remaining: usize,
    },
}

impl Arrival {
    /// Returns true for the last arrival.
    #[must_use]
    pub const fn is_last(self) -> bool {
        matches!(self, Self::Last)
    }
}

/// Counts finished workers of one relay stage.
///
/// `arrive` is the only mutating operation: each worker calls it exactly
/// once on exit, and exactly one call observes [`Arrival::Last`].
#[derive(Debug)]
pub struct CompletionCounter {
    done: Mutex<usize>,
    workers: usize,
    scope: Scope,
}

impl CompletionCounter {
    /// Creates a counter for a stage with `workers` workers.
    #[must_use]
    pub fn new(workers: usize, scope: Scope) -> Self {
        Self {
            done: Mutex::new(0),
            workers,
            scope,
        }
    }

    /// Records one worker exit and reports whether it was the last.
    pub fn arrive(&self) -> Arrival {
        let done = {
            let mut done = self.done.lock();
            *done += 1;
            *done
        };
        if done == self.workers {
            Arrival::Last
        } else {
            Arrival::Pending {
                remaining: self.workers.saturating_sub(done),
            }
        }
    }

    /// Returns the number of workers that have arrived.
    #[must_use]
    pub fn completed(&self) -> usize {
        *self.done.lock()
    }

    /// Returns the expected number of workers.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Returns the scope label given at construction.
    #[must_use]
    pub const fn scope(&self) -> Scope {
        self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_single_worker_is_last() {
        let counter = CompletionCounter::new(1, Scope::Thread);
        assert_eq!(counter.arrive(), Arrival::Last);
    }

    #[test]
    fn test_sequential_arrivals() {
        let counter = CompletionCounter::new(3, Scope::Process);

        assert_eq!(counter.arrive(), Arrival::Pending { remaining: 2 });
        assert_eq!(counter.arrive(), Arrival::Pending { remaining: 1 });
        assert_eq!(counter.arrive(), Arrival::Last);
        assert_eq!(counter.completed(), 3);
        assert_eq!(counter.scope(), Scope::Process);
    }

    #[test]
    fn test_exactly_one_last_under_contention() {
        for _ in 0..50 {
            let counter = Arc::new(CompletionCounter::new(16, Scope::Thread));
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let counter = Arc::clone(&counter);
                    thread::spawn(move || counter.arrive().is_last())
                })
                .collect();

            let lasts = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|last| *last)
                .count();
            assert_eq!(lasts, 1);
        }
    }
}
