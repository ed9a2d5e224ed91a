//! Per-stage and per-run counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Counters for one stage, shared by all of its workers.
#[derive(Debug, Default)]
pub struct StageStats {
    /// Number of task invocations.
    processed: AtomicU64,
    /// Number of outputs written downstream.
    emitted: AtomicU64,
    /// Number of inputs whose output was discarded. See
    /// [`StageStatsSnapshot::dropped`].
    dropped: AtomicU64,
    /// Number of faults raised by workers.
    faults: AtomicU64,
}

impl StageStats {
    /// Records a task invocation.
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an output written downstream.
    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one input whose output was discarded.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a worker fault.
    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> StageStatsSnapshot {
        StageStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`StageStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatsSnapshot {
    /// Number of task invocations.
    pub processed: u64,
    /// Number of outputs written downstream.
    pub emitted: u64,
    /// Number of inputs whose output was discarded.
    ///
    /// Counted once per input, never per output: an input skipped after
    /// shutdown or after its worker failed counts once, and so does a call
    /// whose output was cut off by shutdown, however many items its
    /// generator would still have yielded.
    pub dropped: u64,
    /// Number of worker faults.
    pub faults: u64,
}

/// Counters for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunStats {
    run_id: Uuid,
    started: Instant,
    stages: Vec<(String, Arc<StageStats>)>,
}

impl RunStats {
    /// Creates stats for a new run with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started: Instant::now(),
            stages: Vec::new(),
        }
    }

    /// Registers a stage and returns its shared counters.
    pub fn register(&mut self, stage: impl Into<String>) -> Arc<StageStats> {
        let stats = Arc::new(StageStats::default());
        self.stages.push((stage.into(), Arc::clone(&stats)));
        stats
    }

    /// Returns the run id.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the time since the run started, in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the counters of a stage by position.
    #[must_use]
    pub fn stage(&self, index: usize) -> Option<StageStatsSnapshot> {
        self.stages.get(index).map(|(_, stats)| stats.snapshot())
    }

    /// Returns the total number of faults across stages.
    #[must_use]
    pub fn total_faults(&self) -> u64 {
        self.stages.iter().map(|(_, s)| s.snapshot().faults).sum()
    }

    /// Converts the stats to JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let stages: Vec<_> = self
            .stages
            .iter()
            .map(|(name, stats)| {
                let snapshot = stats.snapshot();
                serde_json::json!({
                    "stage": name,
                    "processed": snapshot.processed,
                    "emitted": snapshot.emitted,
                    "dropped": snapshot.dropped,
                    "faults": snapshot.faults,
                })
            })
            .collect();

        serde_json::json!({
            "run_id": self.run_id.to_string(),
            "elapsed_ms": (self.elapsed_ms() * 100.0).round() / 100.0,
            "stages": stages,
        })
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_stats_recording() {
        let stats = StageStats::default();
        stats.record_processed();
        stats.record_processed();
        stats.record_emitted();
        stats.record_dropped();
        stats.record_fault();

        assert_eq!(
            stats.snapshot(),
            StageStatsSnapshot {
                processed: 2,
                emitted: 1,
                dropped: 1,
                faults: 1,
            }
        );
    }

    #[test]
    fn test_run_stats_registration() {
        let mut run = RunStats::new();
        let first = run.register("load");
        let second = run.register("double");
        first.record_emitted();
        second.record_fault();

        assert_eq!(run.stage(0).unwrap().emitted, 1);
        assert_eq!(run.stage(1).unwrap().faults, 1);
        assert!(run.stage(2).is_none());
        assert_eq!(run.total_faults(), 1);
    }

    #[test]
    fn test_run_stats_to_json() {
        let mut run = RunStats::new();
        run.register("load").record_processed();

        let json = run.to_json();
        assert_eq!(json["stages"][0]["stage"], "load");
        assert_eq!(json["stages"][0]["processed"], 1);
        assert_eq!(json["run_id"], run.run_id().to_string());
    }
}
