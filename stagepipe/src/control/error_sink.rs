//! Shared sink for worker faults.

use super::Scope;
use crate::errors::WorkerFault;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// A FIFO of faults raised by workers during one pipeline run.
///
/// Faults keep their arrival order. When several workers fail
/// concurrently, the driver surfaces the first one to arrive.
#[derive(Clone)]
pub struct ErrorSink {
    faults: Arc<Mutex<VecDeque<WorkerFault>>>,
    scope: Scope,
}

impl ErrorSink {
    /// Creates an empty sink for the given scope.
    #[must_use]
    pub fn new(scope: Scope) -> Self {
        Self {
            faults: Arc::new(Mutex::new(VecDeque::new())),
            scope,
        }
    }

    /// Records a fault.
    pub fn push(&self, fault: WorkerFault) {
        warn!(
            stage = %fault.stage,
            worker = fault.worker,
            error = %format!("{:#}", fault.error),
            "Worker fault recorded"
        );
        self.faults.lock().push_back(fault);
    }

    /// Removes and returns the earliest fault.
    pub fn take_first(&self) -> Option<WorkerFault> {
        self.faults.lock().pop_front()
    }

    /// Removes and returns every fault in arrival order.
    pub fn drain(&self) -> Vec<WorkerFault> {
        self.faults.lock().drain(..).collect()
    }

    /// Returns the number of recorded faults.
    #[must_use]
    pub fn len(&self) -> usize {
        self.faults.lock().len()
    }

    /// Returns true if no fault was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.lock().is_empty()
    }

    /// Returns the scope label given at construction.
    #[must_use]
    pub const fn scope(&self) -> Scope {
        self.scope
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new(Scope::Thread)
    }
}

impl std::fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSink")
            .field("faults", &self.len())
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_keeps_arrival_order() {
        let sink = ErrorSink::default();
        sink.push(WorkerFault::new("a", 0, anyhow::anyhow!("first")));
        sink.push(WorkerFault::new("b", 1, anyhow::anyhow!("second")));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.take_first().unwrap().stage, "a");
        assert_eq!(sink.take_first().unwrap().stage, "b");
        assert!(sink.take_first().is_none());
    }

    #[test]
    fn test_sink_shared_between_clones() {
        let sink = ErrorSink::new(Scope::Process);
        let writer = sink.clone();

        std::thread::spawn(move || {
            writer.push(WorkerFault::new("remote", 3, anyhow::anyhow!("boom")));
        })
        .join()
        .unwrap();

        let faults = sink.drain();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].worker, 3);
        assert!(sink.is_empty());
    }
}
