//! Monotonic shutdown flag for cooperative cancellation.

use super::Scope;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A pipeline-wide advisory cancellation signal.
///
/// Once set it is never reset. Setting it never interrupts running task
/// code; workers read it before each write to their output queue and drop
/// output while it is set. Only the first reason is kept.
#[derive(Clone)]
pub struct ShutdownFlag {
    set: Arc<AtomicBool>,
    reason: Arc<RwLock<Option<String>>>,
    scope: Scope,
}

impl ShutdownFlag {
    /// Creates an unset flag for the given scope.
    #[must_use]
    pub fn new(scope: Scope) -> Self {
        Self {
            set: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(RwLock::new(None)),
            scope,
        }
    }

    /// Sets the flag.
    ///
    /// Returns true if this call was the one that set it.
    pub fn set(&self, reason: impl Into<String>) -> bool {
        if self
            .set
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let reason = reason.into();
            debug!(scope = %self.scope, reason = %reason, "Shutdown requested");
            *self.reason.write() = Some(reason);
            true
        } else {
            false
        }
    }

    /// Returns whether shutdown has been requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Returns the first shutdown reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Returns the scope label given at construction.
    #[must_use]
    pub const fn scope(&self) -> Scope {
        self.scope
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new(Scope::Thread)
    }
}

impl std::fmt::Debug for ShutdownFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownFlag")
            .field("set", &self.is_set())
            .field("reason", &self.reason())
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_flag_default_unset() {
        let flag = ShutdownFlag::default();
        assert!(!flag.is_set());
        assert!(flag.reason().is_none());
        assert_eq!(flag.scope(), Scope::Thread);
    }

    #[test]
    fn test_flag_first_reason_wins() {
        let flag = ShutdownFlag::new(Scope::Process);

        assert!(flag.set("first"));
        assert!(!flag.set("second"));

        assert!(flag.is_set());
        assert_eq!(flag.reason(), Some("first".to_string()));
    }

    #[test]
    fn test_flag_visible_across_clones() {
        let flag = ShutdownFlag::default();
        let remote = flag.clone();

        thread::spawn(move || {
            remote.set("from worker");
        })
        .join()
        .unwrap();

        assert!(flag.is_set());
    }

    #[test]
    fn test_flag_exactly_one_setter_under_race() {
        let flag = ShutdownFlag::default();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let flag = flag.clone();
                thread::spawn(move || flag.set(format!("worker {i}")))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
