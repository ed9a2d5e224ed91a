//! Testing utilities for stagepipe pipelines.
//!
//! This module provides:
//! - Ready-made task fixtures (`doubler`, `pairs`, `fail_on_nth`, ...)
//! - A recording task for inspecting stage inputs
//! - Assertions for run results

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_run_ok, assert_same_items, assert_worker_fault};
pub use fixtures::{
    async_doubler, doubler, emit_each, fail_on_nth, pairs, range_source, slow_identity, summer,
    ValueError,
};
pub use mocks::{RecordedCall, RecordingTask};
