//! Observability utilities.

mod logging;
mod stats;

pub use logging::{init_tracing, LogFormat};
pub use stats::{RunStats, StageStats, StageStatsSnapshot};
