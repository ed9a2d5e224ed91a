//! Worker pools for the threaded runners.

use crate::errors::StagepipeError;
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// A unit of work submitted to a pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Describes the worker a job runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Name of the stage the worker belongs to.
    pub stage: String,
    /// Index of the worker within its stage.
    pub worker: usize,
    /// The pool does not need to track the worker for joining.
    pub daemon: bool,
    /// The worker runs an isolated task.
    pub multiprocess: bool,
}

impl WorkerSpec {
    /// Creates a spec for worker `worker` of `stage`.
    #[must_use]
    pub fn new(stage: impl Into<String>, worker: usize) -> Self {
        Self {
            stage: stage.into(),
            worker,
            daemon: false,
            multiprocess: false,
        }
    }

    /// Sets the daemon flag.
    #[must_use]
    pub const fn with_daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Sets the multiprocess flag.
    #[must_use]
    pub const fn with_multiprocess(mut self, multiprocess: bool) -> Self {
        self.multiprocess = multiprocess;
        self
    }
}

/// Schedules worker jobs.
///
/// Submission never waits for the job to run and may be called repeatedly
/// and concurrently.
#[cfg_attr(test, mockall::automock)]
pub trait WorkerPool: Send + Sync {
    /// Schedules `job` to run as the worker described by `spec`.
    fn submit(&self, spec: WorkerSpec, job: Job) -> Result<(), StagepipeError>;
}

/// A pool giving every worker its own named OS thread.
///
/// Non-daemon workers are tracked and waited for by [`join`](Self::join);
/// daemon workers are detached.
#[derive(Debug)]
pub struct ThreadWorkerPool {
    name_prefix: String,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadWorkerPool {
    /// Creates a pool naming its threads `<prefix>-<stage>-<worker>`.
    #[must_use]
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Waits for every tracked worker submitted so far.
    pub fn join(&self) -> Result<(), StagepipeError> {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());

        let mut panicked = 0;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }

        if panicked == 0 {
            Ok(())
        } else {
            Err(StagepipeError::Runtime(format!(
                "{panicked} worker thread(s) panicked outside task code"
            )))
        }
    }

    /// Returns the number of tracked workers not yet joined.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.handles.lock().len()
    }
}

impl Default for ThreadWorkerPool {
    fn default() -> Self {
        Self::new("stagepipe")
    }
}

impl WorkerPool for ThreadWorkerPool {
    fn submit(&self, spec: WorkerSpec, job: Job) -> Result<(), StagepipeError> {
        let name = format!("{}-{}-{}", self.name_prefix, spec.stage, spec.worker);
        debug!(
            thread = %name,
            daemon = spec.daemon,
            multiprocess = spec.multiprocess,
            "Spawning worker"
        );

        let handle = thread::Builder::new().name(name).spawn(job)?;
        if !spec.daemon {
            self.handles.lock().push(handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_submit_runs_job() {
        let pool = ThreadWorkerPool::default();
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let counter = Arc::clone(&counter);
            pool.submit(
                WorkerSpec::new("count", i),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        }

        assert_eq!(pool.tracked(), 4);
        pool.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(pool.tracked(), 0);
    }

    #[test]
    fn test_thread_is_named() {
        let pool = ThreadWorkerPool::new("unit");
        let name = Arc::new(parking_lot::Mutex::new(None));

        let seen = Arc::clone(&name);
        pool.submit(
            WorkerSpec::new("stage", 2),
            Box::new(move || {
                *seen.lock() = thread::current().name().map(ToString::to_string);
            }),
        )
        .unwrap();
        pool.join().unwrap();

        assert_eq!(name.lock().as_deref(), Some("unit-stage-2"));
    }

    #[test]
    fn test_daemon_not_tracked() {
        let pool = ThreadWorkerPool::default();
        let (tx, rx) = std::sync::mpsc::channel();

        pool.submit(
            WorkerSpec::new("bg", 0).with_daemon(true),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        )
        .unwrap();

        assert_eq!(pool.tracked(), 0);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_join_reports_panics() {
        let pool = ThreadWorkerPool::default();
        pool.submit(WorkerSpec::new("bad", 0), Box::new(|| panic!("outside task code")))
            .unwrap();

        assert!(matches!(pool.join(), Err(StagepipeError::Runtime(_))));
    }
}
